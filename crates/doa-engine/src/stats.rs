//! Summary statistics shared by the builder, the binned truth and aggregation.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Half-width of the grid the standard normal CDF is evaluated on.
const CDF_GRID_LIMIT: f64 = 5.0;
const CDF_GRID_POINTS: usize = 1001;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (`ddof = 0`).
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Sample variance (`ddof = 1`), NaN for fewer than two values.
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0)
}

pub fn sample_std(values: &[f64]) -> f64 {
    sample_variance(values).sqrt()
}

/// Standard error of the mean, NaN for fewer than two values.
pub fn sem(values: &[f64]) -> f64 {
    sample_std(values) / (values.len() as f64).sqrt()
}

pub fn rms(values: &[f64]) -> f64 {
    mean(&values.iter().map(|v| v * v).collect::<Vec<_>>()).sqrt()
}

/// Regression quality of a set of predictions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub count: usize,
    #[serde(with = "doa_core::nan_as_null")]
    pub rmse: f64,
    /// RMSE over the sample standard deviation of `y`; NaN when `count < 2`.
    #[serde(with = "doa_core::nan_as_null")]
    pub rmse_over_sigma: f64,
    #[serde(with = "doa_core::nan_as_null")]
    pub mae: f64,
    /// Coefficient of determination; NaN when `y` is constant.
    #[serde(with = "doa_core::nan_as_null")]
    pub r2: f64,
}

impl RegressionMetrics {
    pub fn compute(y: &[f64], y_pred: &[f64]) -> Self {
        let residuals: Vec<f64> = y.iter().zip(y_pred).map(|(a, b)| a - b).collect();
        let rmse = rms(&residuals);
        let mae = mean(&residuals.iter().map(|r| r.abs()).collect::<Vec<_>>());

        let y_mean = mean(y);
        let ss_res: f64 = residuals.iter().map(|r| r * r).sum();
        let ss_tot: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
        let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { f64::NAN };

        Self {
            count: y.len(),
            rmse,
            rmse_over_sigma: rmse / sample_std(y),
            mae,
            r2,
        }
    }
}

/// Piecewise-linear interpolation with the ends clamped, as `np.interp` does.
fn interp(p: f64, xs: &[f64], fs: &[f64]) -> f64 {
    let last = xs.len() - 1;
    if p <= xs[0] {
        return fs[0];
    }
    if p >= xs[last] {
        return fs[last];
    }
    let j = xs.partition_point(|v| *v <= p) - 1;
    let (x0, x1) = (xs[j], xs[j + 1]);
    fs[j] + (fs[j + 1] - fs[j]) * (p - x0) / (x1 - x0)
}

fn trapezoid(y: &[f64], x: &[f64]) -> f64 {
    y.windows(2)
        .zip(x.windows(2))
        .map(|(yw, xw)| 0.5 * (yw[0] + yw[1]) * (xw[1] - xw[0]))
        .sum()
}

/// Areas between the empirical CDF of `z` and the standard normal CDF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MiscalibrationArea {
    /// Integrated over the standard normal CDF (the parity plot).
    pub parity: f64,
    /// Integrated over `z` itself.
    pub cdf: f64,
}

impl MiscalibrationArea {
    pub fn nan() -> Self {
        Self {
            parity: f64::NAN,
            cdf: f64::NAN,
        }
    }
}

/// Miscalibration of standardized residuals against `N(0, 1)`.
///
/// Both CDFs are evaluated on the union of the observed values and a fixed
/// grid on `[-5, 5]`. NaN for fewer than two finite values.
pub fn miscalibration_area(z: &[f64]) -> MiscalibrationArea {
    let mut sorted: Vec<f64> = z.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.len() < 2 {
        return MiscalibrationArea::nan();
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let n = sorted.len();
    let frac: Vec<f64> = (0..n).map(|i| i as f64 / (n - 1) as f64).collect();

    let step = 2.0 * CDF_GRID_LIMIT / (CDF_GRID_POINTS - 1) as f64;
    let mut eval_points: Vec<f64> = (0..CDF_GRID_POINTS)
        .map(|i| -CDF_GRID_LIMIT + i as f64 * step)
        .chain(sorted.iter().copied())
        .collect();
    eval_points.sort_by(|a, b| a.total_cmp(b));
    eval_points.dedup();

    let normal = match Normal::new(0.0, 1.0) {
        Ok(n) => n,
        Err(_) => return MiscalibrationArea::nan(),
    };
    let observed: Vec<f64> = eval_points.iter().map(|p| interp(*p, &sorted, &frac)).collect();
    let ideal: Vec<f64> = eval_points.iter().map(|p| normal.cdf(*p)).collect();
    let gap: Vec<f64> = observed.iter().zip(&ideal).map(|(a, b)| (a - b).abs()).collect();

    MiscalibrationArea {
        parity: trapezoid(&gap, &ideal),
        cdf: trapezoid(&gap, &eval_points),
    }
}

/// Equal-count bin of every position in a sequence of length `n`.
///
/// Matches quantile cutting of the ranks `1..=n` into `bins` right-closed
/// intervals; with `n <= bins` every position gets its own bin.
pub fn quantile_bins(n: usize, bins: usize) -> Vec<usize> {
    if n < 2 || bins < 2 {
        return vec![0; n];
    }
    (0..n)
        .map(|i| {
            if i == 0 {
                0
            } else {
                let k = (i * bins + n - 2) / (n - 1);
                k.saturating_sub(1).min(bins - 1)
            }
        })
        .collect()
}
