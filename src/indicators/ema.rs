// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   alpha = 2 / (period + 1)
//   EMA_0 = values[0]
//   EMA_t = alpha * x_t + (1 - alpha) * EMA_{t-1}
// =============================================================================

/// Compute the full EMA series over `values` for the given `period`.
///
/// The output has the same length as the input (the first element seeds the
/// recurrence). An empty input or zero period yields an empty vec.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }

    let alpha = 2.0 / (period + 1) as f64;
    let mut out = Vec::with_capacity(values.len());
    out.push(values[0]);

    let mut prev = values[0];
    for &x in &values[1..] {
        let next = alpha * x + (1.0 - alpha) * prev;
        out.push(next);
        prev = next;
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(ema(&[], 5).is_empty());
    }

    #[test]
    fn ema_period_zero() {
        assert!(ema(&[1.0, 2.0], 0).is_empty());
    }

    #[test]
    fn ema_single_value_is_seed() {
        assert_eq!(ema(&[42.0], 9), vec![42.0]);
    }

    #[test]
    fn ema_known_values() {
        // period 3 => alpha = 0.5
        let values = [2.0, 4.0, 8.0];
        let out = ema(&values, 3);
        assert_eq!(out.len(), 3);
        assert!((out[0] - 2.0).abs() < 1e-12);
        assert!((out[1] - 3.0).abs() < 1e-12); // 0.5*4 + 0.5*2
        assert!((out[2] - 5.5).abs() < 1e-12); // 0.5*8 + 0.5*3
    }

    #[test]
    fn ema_constant_input_stays_constant() {
        let out = ema(&[7.0; 50], 12);
        for v in out {
            assert!((v - 7.0).abs() < 1e-12);
        }
    }

    #[test]
    fn ema_tracks_trend_with_lag() {
        let values: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let out = ema(&values, 10);
        let last = *out.last().unwrap();
        // EMA lags a rising series but stays below the latest value.
        assert!(last < 100.0);
        assert!(last > 90.0);
    }
}
