//! Orthogonal distance regression.
//!
//! Each point may move along x by a correction `δ` that is paid for in units
//! of `sx`, while the vertical misfit is paid for in units of `sy`. For fixed
//! parameters the best `δ` of every point is found separately, which leaves
//! a reduced residual per point that the Levenberg–Marquardt core in
//! [`super::solve`] minimises over the parameters alone.

use nalgebra::DVector;
use tracing::{debug, warn};

use crate::error::{FitError, Warning};
use crate::expression::Model;

use super::solve::{self, Residuals, DIFF_STEP};
use super::RawFit;

pub(crate) const ODR_MAX_ITERS: usize = 250;

/// Stand-in y uncertainty that makes the x uncertainty the only weight.
pub(crate) const NEGLIGIBLE_SY: f64 = 1e-50;

const INNER_MAX_ITERS: usize = 50;
const INNER_TOLERANCE: f64 = 1e-12;
const MAX_HALVINGS: usize = 30;

struct OrthogonalResiduals<'a> {
    model: &'a Model,
    x: &'a [f64],
    y: &'a [f64],
    sx: &'a [f64],
    sy: &'a [f64],
}

/// One point's best x-correction and the residual it leaves.
struct PointFit {
    delta: f64,
    residual: f64,
}

impl OrthogonalResiduals<'_> {
    fn value(&self, u: f64, params: &[f64], row: usize) -> Result<f64, FitError> {
        let value = self.model.evaluate_at(u, params);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(FitError::NumericInvalid { row })
        }
    }

    fn slope(&self, u: f64, params: &[f64], row: usize) -> Result<f64, FitError> {
        let h = DIFF_STEP * (1.0 + u.abs());
        let forward = self.model.evaluate_at(u + h, params);
        let backward = self.model.evaluate_at(u - h, params);
        let slope = (forward - backward) / (2.0 * h);
        if slope.is_finite() {
            Ok(slope)
        } else {
            Err(FitError::NumericInvalid { row })
        }
    }

    /// Minimises `sx²·(y - f(x+δ))² + sy²·δ²` over `δ` with damped
    /// Gauss–Newton steps.
    fn correction(&self, row: usize, params: &[f64]) -> Result<f64, FitError> {
        let (x, y, sx2, sy2) = (
            self.x[row],
            self.y[row],
            self.sx[row] * self.sx[row],
            self.sy[row] * self.sy[row],
        );
        if sx2 == 0.0 {
            return Ok(0.0);
        }

        let objective = |delta: f64, fitted: f64| {
            let misfit = y - fitted;
            sx2 * misfit * misfit + sy2 * delta * delta
        };

        let mut delta = 0.0;
        let mut current = objective(delta, self.value(x, params, row)?);

        for _ in 0..INNER_MAX_ITERS {
            let u = x + delta;
            let misfit = y - self.value(u, params, row)?;
            let slope = self.slope(u, params, row)?;
            let denom = slope * slope * sx2 + sy2;
            if !(denom > 0.0) {
                break;
            }

            let mut step = (misfit * slope * sx2 - delta * sy2) / denom;
            let mut improved = false;
            for _ in 0..MAX_HALVINGS {
                let trial = delta + step;
                let fitted = self.model.evaluate_at(x + trial, params);
                if fitted.is_finite() {
                    let value = objective(trial, fitted);
                    if value <= current {
                        delta = trial;
                        current = value;
                        improved = true;
                        break;
                    }
                }
                step *= 0.5;
            }

            if !improved || step.abs() <= INNER_TOLERANCE * (self.sx[row].abs() + delta.abs()) {
                break;
            }
        }

        Ok(delta)
    }

    /// The residual left at the best `δ`, linearised there:
    /// `(y - f(u) + f'(u)·δ) / sqrt(sy² + f'(u)²·sx²)` with `u = x + δ`.
    fn point(&self, row: usize, params: &[f64]) -> Result<PointFit, FitError> {
        let delta = self.correction(row, params)?;
        let u = self.x[row] + delta;
        let misfit = self.y[row] - self.value(u, params, row)?;
        let slope = self.slope(u, params, row)?;
        let variance = self.sy[row] * self.sy[row] + slope * slope * self.sx[row] * self.sx[row];
        if !(variance > 0.0) {
            return Err(FitError::ZeroUncertainty { column: "sy", row });
        }

        Ok(PointFit {
            delta,
            residual: (misfit + slope * delta) / variance.sqrt(),
        })
    }

    fn corrections(&self, params: &[f64]) -> Result<Vec<f64>, FitError> {
        (0..self.x.len())
            .map(|row| self.point(row, params).map(|point| point.delta))
            .collect()
    }
}

impl Residuals for OrthogonalResiduals<'_> {
    fn residuals(&self, params: &DVector<f64>) -> Result<DVector<f64>, FitError> {
        let params = params.as_slice();
        let values = (0..self.x.len())
            .map(|row| self.point(row, params).map(|point| point.residual))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DVector::from_vec(values))
    }
}

/// ODR using both uncertainties. Reaching the iteration cap is reported as a
/// warning, and a singular beta-covariance leaves `covariance` empty.
pub(crate) fn orthogonal(
    model: &Model,
    x: &[f64],
    y: &[f64],
    sx: &[f64],
    sy: &[f64],
    initial: &[f64],
) -> Result<RawFit, FitError> {
    orthogonal_with_limit(model, x, y, sx, sy, initial, ODR_MAX_ITERS)
}

fn orthogonal_with_limit(
    model: &Model,
    x: &[f64],
    y: &[f64],
    sx: &[f64],
    sy: &[f64],
    initial: &[f64],
    max_iters: usize,
) -> Result<RawFit, FitError> {
    if let Some(row) = (0..x.len()).find(|&i| sx[i] == 0.0 && sy[i] == 0.0) {
        return Err(FitError::ZeroUncertainty { column: "sy", row });
    }

    let problem = OrthogonalResiduals {
        model,
        x,
        y,
        sx,
        sy,
    };
    let minimum = solve::minimize(&problem, DVector::from_column_slice(initial), max_iters)?;

    let mut warnings = Vec::new();
    if !minimum.converged {
        warn!(limit = max_iters, "orthogonal regression hit the iteration limit");
        warnings.push(Warning::IterationLimit { limit: max_iters });
    }

    let params: Vec<f64> = minimum.params.iter().copied().collect();
    let covariance = solve::covariance(&minimum.jacobian);
    if covariance.is_none() {
        warn!("orthogonal regression beta-covariance is singular");
    }
    let x_corrections = problem.corrections(&params)?;

    debug!(
        iterations = minimum.iterations,
        chi_square = minimum.chi_square,
        "orthogonal regression finished"
    );

    Ok(RawFit {
        params,
        covariance,
        chi_square: minimum.chi_square,
        iterations: minimum.iterations,
        derived_sy: None,
        x_corrections: Some(x_corrections),
        warnings,
    })
}

/// ODR driven by `sx` alone, followed by an effective `sy` per point from
/// the spread of the fitted curve over `x ± sx`. Chi-square is recomputed
/// against that effective `sy`; the covariance is the one from the first
/// pass.
pub(crate) fn symmetrized(
    model: &Model,
    x: &[f64],
    y: &[f64],
    sx: &[f64],
    initial: &[f64],
) -> Result<RawFit, FitError> {
    if let Some(row) = sx.iter().position(|s| *s == 0.0) {
        return Err(FitError::ZeroUncertainty { column: "sx", row });
    }

    let negligible = vec![NEGLIGIBLE_SY; x.len()];
    let mut fit = orthogonal(model, x, y, sx, &negligible, initial)?;

    let derived = derived_sigma(model, x, sx, &fit.params)?;
    let fitted = model.evaluate_checked(x, &fit.params)?;
    fit.chi_square = y
        .iter()
        .zip(&fitted)
        .zip(&derived)
        .map(|((y, f), s)| ((y - f) / s).powi(2))
        .sum();
    fit.derived_sy = Some(derived);

    debug!(chi_square = fit.chi_square, "recomputed chi-square with derived sy");
    Ok(fit)
}

/// `(|f(x+sx) - f(x)| + |f(x-sx) - f(x)|) / 2` for every point.
pub(crate) fn derived_sigma(
    model: &Model,
    x: &[f64],
    sx: &[f64],
    params: &[f64],
) -> Result<Vec<f64>, FitError> {
    x.iter()
        .zip(sx)
        .enumerate()
        .map(|(row, (&xi, &si))| {
            let centre = model.evaluate_at(xi, params);
            let above = model.evaluate_at(xi + si, params);
            let below = model.evaluate_at(xi - si, params);
            let sigma = ((above - centre).abs() + (below - centre).abs()) / 2.0;

            if !sigma.is_finite() {
                Err(FitError::NumericInvalid { row })
            } else if sigma == 0.0 {
                Err(FitError::ZeroUncertainty {
                    column: "derived sy",
                    row,
                })
            } else {
                Ok(sigma)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn linear() -> Model {
        Model::build("a*x + b", "x").unwrap()
    }

    #[test]
    fn recovers_exact_line_with_both_uncertainties() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let fit = orthogonal(&linear(), &x, &y, &[0.1; 4], &[0.2; 4], &[1.0, 1.0]).unwrap();

        assert_abs_diff_eq!(fit.params[0], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[1], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.chi_square, 0.0, epsilon = 1e-10);
        assert!(fit.warnings.is_empty());
    }

    #[test]
    fn straight_line_chi_square_uses_effective_variance() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.2, 3.8, 6.3, 7.9, 10.1];
        let sx = [0.1, 0.1, 0.2, 0.1, 0.1];
        let sy = [0.2, 0.3, 0.2, 0.2, 0.3];
        let fit = orthogonal(&linear(), &x, &y, &sx, &sy, &[1.0, 1.0]).unwrap();

        let (a, b) = (fit.params[0], fit.params[1]);
        let expected: f64 = (0..5)
            .map(|i| (y[i] - a * x[i] - b).powi(2) / (sy[i] * sy[i] + a * a * sx[i] * sx[i]))
            .sum();
        assert_relative_eq!(fit.chi_square, expected, max_relative = 1e-6);
        assert!(fit.covariance.is_some());
        assert_eq!(fit.x_corrections.as_ref().map(Vec::len), Some(5));
    }

    #[test]
    fn zero_sx_reduces_to_weighted_least_squares() {
        let x = [1.0, 2.0, 3.0];
        let y = [2.1, 3.9, 6.2];
        let sy = [0.1, 0.1, 0.1];
        let odr = orthogonal(&linear(), &x, &y, &[0.0; 3], &sy, &[1.0, 1.0]).unwrap();
        let lsq = solve::least_squares(&linear(), &x, &y, Some(&sy), &[1.0, 1.0]).unwrap();

        assert_abs_diff_eq!(odr.params[0], lsq.params[0], epsilon = 1e-6);
        assert_abs_diff_eq!(odr.params[1], lsq.params[1], epsilon = 1e-6);
        assert_relative_eq!(odr.chi_square, lsq.chi_square, max_relative = 1e-6);
        let (c_odr, c_lsq) = (odr.covariance.unwrap(), lsq.covariance.unwrap());
        assert_relative_eq!(c_odr[(0, 0)], c_lsq[(0, 0)], max_relative = 1e-4);
    }

    #[test]
    fn derived_sigma_of_a_line_is_slope_times_sx() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.9, 5.2, 6.8, 9.1];
        let sx = [0.1, 0.2, 0.1, 0.3];
        let fit = symmetrized(&linear(), &x, &y, &sx, &[1.0, 1.0]).unwrap();

        let slope = fit.params[0];
        let derived = fit.derived_sy.as_ref().unwrap();
        for (sigma, s) in derived.iter().zip(&sx) {
            assert_relative_eq!(*sigma, slope.abs() * s, max_relative = 1e-9);
        }
        assert!(fit.chi_square.is_finite());
        assert!(fit.chi_square > 0.0);
    }

    #[test]
    fn symmetrized_recovers_exact_curve() {
        let model = Model::build("A*x^2", "x").unwrap();
        let x = [1.0, 2.0, 3.0];
        let y = [3.0, 12.0, 27.0];
        let fit = symmetrized(&model, &x, &y, &[0.05; 3], &[1.0]).unwrap();

        assert_abs_diff_eq!(fit.params[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.chi_square, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn symmetrized_needs_nonzero_sx() {
        let err = symmetrized(&linear(), &[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], &[0.1, 0.0, 0.1], &[1.0, 1.0])
            .unwrap_err();
        assert_eq!(err, FitError::ZeroUncertainty { column: "sx", row: 1 });
    }

    #[test]
    fn flat_model_has_no_derived_sigma() {
        let model = Model::with_neutral_term("c", "x").unwrap();
        let err = derived_sigma(&model, &[1.0, 2.0], &[0.1, 0.1], &[4.0]).unwrap_err();
        assert_eq!(
            err,
            FitError::ZeroUncertainty {
                column: "derived sy",
                row: 0
            }
        );
    }

    #[test]
    fn iteration_cap_is_a_warning() {
        let model = Model::build("A*exp(-k*x)", "x").unwrap();
        let x: Vec<f64> = (0..8).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|xi| 3.0 * (-0.7 * xi).exp()).collect();
        let sx = vec![0.01; x.len()];
        let sy = vec![0.05; x.len()];

        let capped = orthogonal_with_limit(&model, &x, &y, &sx, &sy, &[1.0, 1.0], 1).unwrap();
        assert_eq!(capped.iterations, 1);
        assert_eq!(capped.warnings, vec![Warning::IterationLimit { limit: 1 }]);

        let full = orthogonal(&model, &x, &y, &sx, &sy, &[1.0, 1.0]).unwrap();
        assert!(full.warnings.is_empty());
        assert_abs_diff_eq!(full.params[0], 3.0, epsilon = 1e-4);
    }

    #[test]
    fn both_uncertainties_zero_is_rejected() {
        let err = orthogonal(&linear(), &[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], &[0.1, 0.0, 0.1], &[0.1, 0.0, 0.1], &[1.0, 1.0])
            .unwrap_err();
        assert_eq!(err, FitError::ZeroUncertainty { column: "sy", row: 1 });
    }
}
