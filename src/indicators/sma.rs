// =============================================================================
// Simple Moving Average, regression slope, slope segmentation
// =============================================================================
//
// The SMA uses a Kahan-compensated sliding-window sum: the naive cumulative
// approach drifts over long streams, the compensated form keeps the running
// error at the ulp level without re-seeding.
// =============================================================================

use crate::errors::IndicatorError;

#[inline]
fn kahan_add(sum: &mut f64, c: &mut f64, x: f64) {
    let y = x - *c;
    let t = *sum + y;
    *c = (t - *sum) - y;
    *sum = t;
}

/// Sliding simple moving average of `values` over `window`.
///
/// Returns one value per window position: `values.len() - window + 1` outputs.
pub fn sma(values: &[f64], window: usize) -> Result<Vec<f64>, IndicatorError> {
    if window == 0 {
        return Err(IndicatorError::ZeroPeriod);
    }
    let n = values.len();
    if n < window {
        return Err(IndicatorError::InsufficientData {
            needed: window,
            got: n,
        });
    }

    let window_f = window as f64;
    let mut out = Vec::with_capacity(n - window + 1);

    let mut sum = 0.0_f64;
    let mut c = 0.0_f64;
    for &v in &values[..window] {
        kahan_add(&mut sum, &mut c, v);
    }
    out.push(sum / window_f);

    for i in window..n {
        kahan_add(&mut sum, &mut c, values[i]);
        kahan_add(&mut sum, &mut c, -values[i - window]);
        out.push(sum / window_f);
    }

    Ok(out)
}

/// Least-squares slope of `series` over each `window`-sized span.
///
/// `window` must be at least 2 (a single point has no slope).
pub fn regression_slope(series: &[f64], window: usize) -> Result<Vec<f64>, IndicatorError> {
    if window < 2 {
        return Err(IndicatorError::ZeroPeriod);
    }
    let n = series.len();
    if n < window {
        return Err(IndicatorError::InsufficientData {
            needed: window,
            got: n,
        });
    }

    let x_mean = (window - 1) as f64 / 2.0;
    let denom: f64 = (0..window)
        .map(|j| {
            let d = j as f64 - x_mean;
            d * d
        })
        .sum();

    let mut slopes = Vec::with_capacity(n - window + 1);
    for i in 0..=(n - window) {
        let y = &series[i..i + window];
        let y_mean = y.iter().sum::<f64>() / window as f64;
        let numer: f64 = y
            .iter()
            .enumerate()
            .map(|(j, &v)| (j as f64 - x_mean) * (v - y_mean))
            .sum();
        slopes.push(numer / denom);
    }

    Ok(slopes)
}

/// A run of slopes with a consistent direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlopeSegment {
    /// First index of the segment (inclusive).
    pub start: usize,
    /// Last index of the segment (inclusive).
    pub end: usize,
    pub mean_slope: f64,
}

/// Split `slopes` into segments at sign flips and at first-order jumps larger
/// than `tol`, reporting the mean slope of each segment.
pub fn slope_segments(slopes: &[f64], tol: f64) -> Vec<SlopeSegment> {
    if slopes.is_empty() {
        return Vec::new();
    }

    let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;

    let mut segments = Vec::new();
    let mut start = 0;
    let mut current = slopes[0];

    for i in 1..slopes.len() {
        if slopes[i] * current < 0.0 || (slopes[i] - current).abs() > tol {
            segments.push(SlopeSegment {
                start,
                end: i - 1,
                mean_slope: mean(&slopes[start..i]),
            });
            start = i;
            current = slopes[i];
        }
    }

    segments.push(SlopeSegment {
        start,
        end: slopes.len() - 1,
        mean_slope: mean(&slopes[start..]),
    });

    segments
}
