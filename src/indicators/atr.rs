// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the Wilder-smoothed average of TR:
//   ATR_0 = mean of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::errors::IndicatorError;

/// Compute the most recent ATR value from parallel high/low/close buffers
/// (oldest first).
///
/// All three slices must have the same length; `period + 1` rows are required
/// since each True Range needs the previous close.
pub fn atr(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    period: usize,
) -> Result<f64, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    debug_assert!(highs.len() == lows.len() && lows.len() == closes.len());
    let n = highs.len().min(lows.len()).min(closes.len());
    if n < period + 1 {
        return Err(IndicatorError::InsufficientData {
            needed: period + 1,
            got: n,
        });
    }

    let mut tr = Vec::with_capacity(n - 1);
    for i in 1..n {
        let hl = highs[i] - lows[i];
        let hc = (highs[i] - closes[i - 1]).abs();
        let lc = (lows[i] - closes[i - 1]).abs();
        tr.push(hl.max(hc).max(lc));
    }

    let period_f = period as f64;
    let mut value = tr[..period].iter().sum::<f64>() / period_f;
    for &t in &tr[period..] {
        value = (value * (period_f - 1.0) + t) / period_f;
    }

    Ok(value)
}
