use nalgebra::DMatrix;
use serde::Serialize;

use crate::expression::Model;

/// Summary statistics of the vertical residuals `y - f(x)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub max_abs: f64,
}

pub(crate) fn summarize_residuals(residuals: &[f64]) -> ResidualSummary {
    let n = residuals.len().max(1) as f64;
    let mean = residuals.iter().sum::<f64>() / n;

    let mut variance_sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut max_abs = 0.0_f64;

    for &value in residuals {
        let diff = value - mean;
        variance_sum += diff * diff;
        min = min.min(value);
        max = max.max(value);
        max_abs = max_abs.max(value.abs());
    }

    ResidualSummary {
        mean,
        std_dev: (variance_sum / n).sqrt(),
        min,
        max,
        max_abs,
    }
}

/// `cov(i, j) / (σ_i σ_j)`. Entries with a zero or undefined σ are NaN.
pub(crate) fn correlation(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let sigma: Vec<f64> = covariance.diagonal().iter().map(|v| v.sqrt()).collect();
    DMatrix::from_fn(covariance.nrows(), covariance.ncols(), |i, j| {
        let scale = sigma[i] * sigma[j];
        if scale > 0.0 {
            covariance[(i, j)] / scale
        } else {
            f64::NAN
        }
    })
}

/// Evenly spaced `(x, f(x))` samples over `[lo, hi]`.
pub fn prediction_curve(model: &Model, params: &[f64], (lo, hi): (f64, f64), samples: usize) -> Vec<(f64, f64)> {
    match samples {
        0 => Vec::new(),
        1 => vec![(lo, model.evaluate_at(lo, params))],
        _ => {
            let step = (hi - lo) / (samples - 1) as f64;
            (0..samples)
                .map(|i| {
                    let x = if i + 1 == samples { hi } else { lo + step * i as f64 };
                    (x, model.evaluate_at(x, params))
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn residual_summary_statistics() {
        let summary = summarize_residuals(&[1.0, -3.0, 2.0]);
        assert_abs_diff_eq!(summary.mean, 0.0);
        assert_abs_diff_eq!(summary.std_dev, (14.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_eq!(summary.min, -3.0);
        assert_eq!(summary.max, 2.0);
        assert_eq!(summary.max_abs, 3.0);
    }

    #[test]
    fn correlation_is_unit_on_diagonal() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, -3.0, -3.0, 9.0]);
        let corr = correlation(&cov);
        assert_abs_diff_eq!(corr[(0, 0)], 1.0);
        assert_abs_diff_eq!(corr[(1, 1)], 1.0);
        assert_abs_diff_eq!(corr[(0, 1)], -0.5);
        assert_abs_diff_eq!(corr[(1, 0)], -0.5);
    }

    #[test]
    fn curve_spans_the_range() {
        let model = Model::build("a*x", "x").unwrap();
        let curve = prediction_curve(&model, &[2.0], (1.0, 3.0), 5);
        assert_eq!(curve.len(), 5);
        assert_eq!(curve[0], (1.0, 2.0));
        assert_eq!(curve[4], (3.0, 6.0));
        assert_abs_diff_eq!(curve[1].0, 1.5);
    }
}
