// =============================================================================
// Hull Moving Average (HMA) with Kahan-compensated WMA
// =============================================================================
//
// Step 1 — WMA over the trailing half-period window for every index.
// Step 2 — WMA over the trailing full-period window for every index.
// Step 3 — diff = 2 * wma_half - wma_full
// Step 4 — HMA = WMA of the last sqrt(period) diff values.
//
// The half window starts at `max(0, end - period / 2)` (integer division);
// see DESIGN.md for the variant choice. WMA uses compensated summation so
// long windows do not lose precision.
// =============================================================================

use crate::errors::IndicatorError;

/// Linearly weighted mean of `values` with weights `1..=n`, computed with
/// Kahan-compensated summation. Returns NaN for an empty slice.
pub fn wma(values: &[f64]) -> f64 {
    let n = values.len();
    if n == 0 {
        return f64::NAN;
    }

    let weight_sum = (n * (n + 1)) as f64 / 2.0;
    let mut sum = 0.0_f64;
    let mut c = 0.0_f64;
    for (i, &v) in values.iter().enumerate() {
        let y = v * (i + 1) as f64 - c;
        let t = sum + y;
        c = (t - sum) - y;
        sum = t;
    }

    sum / weight_sum
}

/// Compute the most recent Hull Moving Average of `prices` for `period`.
///
/// Requires at least `sqrt(period)` samples so the final smoothing window is
/// fully populated.
pub fn hma(prices: &[f64], period: usize) -> Result<f64, IndicatorError> {
    if period == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    let hma_period = (period as f64).sqrt() as usize;
    let n = prices.len();
    if n < hma_period.max(1) {
        return Err(IndicatorError::InsufficientData {
            needed: hma_period.max(1),
            got: n,
        });
    }

    let mut diff = Vec::with_capacity(n);
    for i in 0..n {
        let end = i + 1;
        let start_half = end.saturating_sub(period / 2);
        let start_full = end.saturating_sub(period);
        let wma_half = wma(&prices[start_half..end]);
        let wma_full = wma(&prices[start_full..end]);
        diff.push(2.0 * wma_half - wma_full);
    }

    Ok(wma(&diff[n - hma_period..]))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wma_empty_is_nan() {
        assert!(wma(&[]).is_nan());
    }

    #[test]
    fn wma_single_value() {
        assert!((wma(&[5.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn wma_known_value() {
        // (1*1 + 2*2 + 3*3) / (1+2+3) = 14 / 6
        let value = wma(&[1.0, 2.0, 3.0]);
        assert!((value - 14.0 / 6.0).abs() < 1e-12, "got {value}");
    }

    #[test]
    fn wma_constant_input() {
        assert!((wma(&[9.0; 100]) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn hma_period_zero() {
        assert_eq!(hma(&[1.0, 2.0], 0), Err(IndicatorError::ZeroPeriod));
    }

    #[test]
    fn hma_insufficient_data() {
        // period 55 => final window of 7.
        let prices = vec![1.0; 5];
        assert_eq!(
            hma(&prices, 55),
            Err(IndicatorError::InsufficientData { needed: 7, got: 5 })
        );
    }

    #[test]
    fn hma_constant_input() {
        let prices = vec![42.0; 120];
        let value = hma(&prices, 55).unwrap();
        assert!((value - 42.0).abs() < 1e-9, "got {value}");
    }

    #[test]
    fn hma_linear_input_extrapolates() {
        // HMA is designed to hug a linear trend with near-zero lag, so for a
        // perfectly linear series it lands close to (or beyond) the last value.
        let prices: Vec<f64> = (1..=200).map(|x| x as f64).collect();
        let value = hma(&prices, 55).unwrap();
        assert!(value > 195.0, "expected near 200, got {value}");
    }

    #[test]
    fn hma_tracks_last_prices_more_than_sma() {
        // Flat at 100 then a jump to 110: HMA should sit much closer to 110
        // than the plain mean of the window does.
        let mut prices = vec![100.0; 60];
        prices.extend(std::iter::repeat(110.0).take(10));
        let value = hma(&prices, 55).unwrap();
        assert!(value > 105.0, "expected responsive HMA, got {value}");
    }
}
