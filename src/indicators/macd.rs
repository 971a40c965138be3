// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd_line   = EMA(prices, fast) - EMA(prices, slow)
//   signal_line = EMA(macd_line, signal)
//   histogram   = macd_line - signal_line
//
// Returns the most recent (macd, signal, histogram) triple.
// =============================================================================

use crate::errors::IndicatorError;

use super::ema::ema;

pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

/// Compute MACD at the last index of `prices`.
pub fn macd(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Result<(f64, f64, f64), IndicatorError> {
    if fast == 0 || slow == 0 || signal == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    if prices.is_empty() {
        return Err(IndicatorError::InsufficientData { needed: 1, got: 0 });
    }

    let ema_fast = ema(prices, fast);
    let ema_slow = ema(prices, slow);

    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal_line = ema(&macd_line, signal);

    let m = *macd_line.last().expect("non-empty by construction");
    let s = *signal_line.last().expect("non-empty by construction");
    Ok((m, s, m - s))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_empty_input() {
        assert_eq!(
            macd(&[], MACD_FAST, MACD_SLOW, MACD_SIGNAL),
            Err(IndicatorError::InsufficientData { needed: 1, got: 0 })
        );
    }

    #[test]
    fn macd_zero_period() {
        assert_eq!(
            macd(&[1.0, 2.0], 0, MACD_SLOW, MACD_SIGNAL),
            Err(IndicatorError::ZeroPeriod)
        );
    }

    #[test]
    fn macd_constant_input_is_zero() {
        let prices = vec![50.0; 100];
        let (m, s, h) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        assert!(m.abs() < 1e-12);
        assert!(s.abs() < 1e-12);
        assert!(h.abs() < 1e-12);
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // Fast EMA sits above slow EMA in a steady uptrend.
        let prices: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let (m, s, _h) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        assert!(m > 0.0, "macd line should be positive, got {m}");
        assert!(s > 0.0, "signal line should be positive, got {s}");
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let prices: Vec<f64> = (1..=200).rev().map(|x| x as f64).collect();
        let (m, _s, _h) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        assert!(m < 0.0, "macd line should be negative, got {m}");
    }

    #[test]
    fn macd_histogram_is_difference() {
        let prices: Vec<f64> = (0..120).map(|i| 100.0 + (i as f64 * 0.3).sin()).collect();
        let (m, s, h) = macd(&prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL).unwrap();
        assert!((h - (m - s)).abs() < 1e-12);
    }
}
