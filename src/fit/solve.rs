use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::FitError;
use crate::expression::Model;

use super::RawFit;

pub(crate) const LM_MAX_ITERS: usize = 2_000;
pub(crate) const LM_TOLERANCE: f64 = 1e-10;
pub(crate) const DIFF_STEP: f64 = 1e-6;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;
const DIAG_FLOOR: f64 = 1e-12;
const CONDITION_LIMIT: f64 = 1e-14;

/// A residual vector as a function of the parameters. The solver minimises
/// its squared norm.
pub(crate) trait Residuals {
    fn residuals(&self, params: &DVector<f64>) -> Result<DVector<f64>, FitError>;
}

#[derive(Debug, Clone)]
pub(crate) struct Minimum {
    pub(crate) params: DVector<f64>,
    pub(crate) jacobian: DMatrix<f64>,
    pub(crate) chi_square: f64,
    pub(crate) iterations: usize,
    pub(crate) converged: bool,
}

/// Levenberg–Marquardt with Marquardt's diagonal scaling and a
/// central-difference Jacobian.
///
/// Stops when an accepted step changes chi-square or the parameters by less
/// than [`LM_TOLERANCE`] (relative), or when no damping level reduces
/// chi-square any further. Running out of iterations returns
/// `converged == false`.
pub(crate) fn minimize<R: Residuals>(
    problem: &R,
    initial: DVector<f64>,
    max_iters: usize,
) -> Result<Minimum, FitError> {
    let mut params = initial;
    let mut residuals = finite(problem.residuals(&params))?;
    let mut chi_square = residuals.norm_squared();
    let mut jacobian = numeric_jacobian(problem, &params, &residuals)?;
    let mut lambda = LAMBDA_INIT;

    for iter in 0..max_iters {
        let gram = jacobian.transpose() * &jacobian;
        let rhs = -(jacobian.transpose() * &residuals);
        let mut accepted = false;

        while lambda <= LAMBDA_MAX {
            let mut damped = gram.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += lambda * gram[(i, i)].max(DIAG_FLOOR);
            }

            let step = match damped.cholesky() {
                Some(chol) => chol.solve(&rhs),
                None => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let trial = &params + &step;
            let trial_residuals = match finite(problem.residuals(&trial)) {
                Ok(values) => values,
                Err(_) => {
                    lambda *= 10.0;
                    continue;
                }
            };

            let trial_chi = trial_residuals.norm_squared();
            if trial_chi > chi_square {
                lambda *= 10.0;
                continue;
            }

            let reduction = chi_square - trial_chi;
            let small_step = step.norm() <= LM_TOLERANCE * (params.norm() + LM_TOLERANCE);

            params = trial;
            residuals = trial_residuals;
            chi_square = trial_chi;
            lambda = (lambda / 10.0).max(LAMBDA_MIN);
            accepted = true;

            if reduction <= LM_TOLERANCE * chi_square || small_step {
                let jacobian = numeric_jacobian(problem, &params, &residuals)?;
                debug!(iterations = iter + 1, chi_square, "solver converged");
                return Ok(Minimum {
                    params,
                    jacobian,
                    chi_square,
                    iterations: iter + 1,
                    converged: true,
                });
            }
            break;
        }

        if !accepted {
            debug!(iterations = iter + 1, chi_square, "no step reduces chi-square further");
            return Ok(Minimum {
                params,
                jacobian,
                chi_square,
                iterations: iter + 1,
                converged: true,
            });
        }

        jacobian = numeric_jacobian(problem, &params, &residuals)?;
    }

    Ok(Minimum {
        params,
        jacobian,
        chi_square,
        iterations: max_iters,
        converged: false,
    })
}

fn numeric_jacobian<R: Residuals>(
    problem: &R,
    params: &DVector<f64>,
    base: &DVector<f64>,
) -> Result<DMatrix<f64>, FitError> {
    let mut jac = DMatrix::zeros(base.len(), params.len());

    for j in 0..params.len() {
        let h = DIFF_STEP * (1.0 + params[j].abs());
        let mut forward = params.clone();
        forward[j] += h;
        let mut backward = params.clone();
        backward[j] -= h;

        let column = match (
            finite(problem.residuals(&forward)),
            finite(problem.residuals(&backward)),
        ) {
            (Ok(f), Ok(b)) => (f - b) / (2.0 * h),
            (Ok(f), Err(_)) => (f - base) / h,
            (Err(_), Ok(b)) => (base - b) / h,
            (Err(err), Err(_)) => return Err(err),
        };
        jac.set_column(j, &column);
    }

    Ok(jac)
}

fn finite(values: Result<DVector<f64>, FitError>) -> Result<DVector<f64>, FitError> {
    let values = values?;
    match values.iter().position(|value| !value.is_finite()) {
        Some(row) => Err(FitError::NumericInvalid { row }),
        None => Ok(values),
    }
}

/// `(JᵀJ)⁻¹`, or `None` when the normal matrix is numerically singular.
pub(crate) fn covariance(jacobian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let gram = jacobian.transpose() * jacobian;
    if gram.nrows() == 0 {
        return None;
    }

    let eigen = gram.clone().symmetric_eigenvalues();
    let largest = eigen.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let smallest = eigen.iter().fold(f64::INFINITY, |acc, v| acc.min(*v));
    if !(largest > 0.0) || smallest <= CONDITION_LIMIT * largest {
        return None;
    }

    let inverse = gram.cholesky()?.inverse();
    let usable = inverse.iter().all(|value| value.is_finite())
        && (0..inverse.nrows()).all(|i| inverse[(i, i)] >= 0.0);
    usable.then_some(inverse)
}

/// `(y - f(x)) * w` for every row; `w = 1/σ` when weighted, `1` otherwise.
struct CurveResiduals<'a> {
    model: &'a Model,
    x: &'a [f64],
    y: &'a [f64],
    weights: Option<Vec<f64>>,
}

impl Residuals for CurveResiduals<'_> {
    fn residuals(&self, params: &DVector<f64>) -> Result<DVector<f64>, FitError> {
        let predicted = self.model.evaluate_checked(self.x, params.as_slice())?;
        let residuals = self
            .y
            .iter()
            .zip(&predicted)
            .enumerate()
            .map(|(i, (y, f))| {
                let w = self.weights.as_ref().map_or(1.0, |weights| weights[i]);
                (y - f) * w
            });
        Ok(DVector::from_iterator(self.y.len(), residuals))
    }
}

/// Nonlinear least squares. With `sigma`, residuals are weighted by `1/σ`
/// and chi-square is the weighted sum; without it, chi-square is the plain
/// sum of squares. The covariance is not rescaled by the residual variance.
pub(crate) fn least_squares(
    model: &Model,
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
    initial: &[f64],
) -> Result<RawFit, FitError> {
    least_squares_with_limit(model, x, y, sigma, initial, LM_MAX_ITERS)
}

fn least_squares_with_limit(
    model: &Model,
    x: &[f64],
    y: &[f64],
    sigma: Option<&[f64]>,
    initial: &[f64],
    max_iters: usize,
) -> Result<RawFit, FitError> {
    let weights = match sigma {
        Some(sigma) => {
            if let Some(row) = sigma.iter().position(|s| *s == 0.0) {
                return Err(FitError::ZeroUncertainty { column: "sy", row });
            }
            Some(sigma.iter().map(|s| 1.0 / s.abs()).collect())
        }
        None => None,
    };

    let problem = CurveResiduals {
        model,
        x,
        y,
        weights,
    };
    let minimum = minimize(&problem, DVector::from_column_slice(initial), max_iters)?;

    if !minimum.converged {
        return Err(FitError::NotConverged {
            iterations: minimum.iterations,
        });
    }

    let covariance = covariance(&minimum.jacobian).ok_or(FitError::SingularCovariance)?;

    Ok(RawFit {
        params: minimum.params.iter().copied().collect(),
        covariance: Some(covariance),
        chi_square: minimum.chi_square,
        iterations: minimum.iterations,
        derived_sy: None,
        x_corrections: None,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn linear() -> Model {
        Model::build("a*x + b", "x").unwrap()
    }

    #[test]
    fn recovers_exact_line() {
        let x = [0.0, 1.0, 2.0];
        let y = [1.0, 3.0, 5.0];
        let fit = least_squares(&linear(), &x, &y, None, &[1.0, 1.0]).unwrap();

        assert_abs_diff_eq!(fit.params[0], 2.0, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.params[1], 1.0, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.chi_square, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn unweighted_covariance_matches_normal_equations() {
        let x = [1.0, 2.0, 3.0];
        let y = [2.1, 3.9, 6.2];
        let fit = least_squares(&linear(), &x, &y, None, &[1.0, 1.0]).unwrap();
        let cov = fit.covariance.unwrap();

        // (XᵀX)⁻¹ for columns [x, 1] with x = 1, 2, 3.
        assert_abs_diff_eq!(cov[(0, 0)], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(cov[(0, 1)], -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cov[(1, 1)], 7.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[0], 2.05, epsilon = 1e-8);
        assert_abs_diff_eq!(fit.params[1], -0.0333333333, epsilon = 1e-8);
    }

    #[test]
    fn weights_scale_chi_square_and_covariance() {
        let x = [1.0, 2.0, 3.0];
        let y = [2.1, 3.9, 6.2];
        let sigma = [0.1, 0.1, 0.1];
        let plain = least_squares(&linear(), &x, &y, None, &[1.0, 1.0]).unwrap();
        let weighted = least_squares(&linear(), &x, &y, Some(&sigma), &[1.0, 1.0]).unwrap();

        assert_abs_diff_eq!(weighted.params[0], plain.params[0], epsilon = 1e-8);
        assert_abs_diff_eq!(weighted.chi_square, plain.chi_square * 100.0, epsilon = 1e-8);
        let (cw, cp) = (weighted.covariance.unwrap(), plain.covariance.unwrap());
        assert_abs_diff_eq!(cw[(0, 0)], cp[(0, 0)] * 0.01, epsilon = 1e-9);
    }

    #[test]
    fn converges_on_exponential_decay() {
        let model = Model::build("A*exp(-k*x)", "x").unwrap();
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|xi| 3.0 * (-0.7 * xi).exp()).collect();
        let fit = least_squares(&model, &x, &y, None, &[1.0, 1.0]).unwrap();

        assert_abs_diff_eq!(fit.params[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(fit.params[1], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn exhausted_iterations_do_not_converge() {
        let model = Model::build("A*exp(-k*x)", "x").unwrap();
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|xi| 3.0 * (-0.7 * xi).exp()).collect();

        let err = least_squares_with_limit(&model, &x, &y, None, &[1.0, 1.0], 1).unwrap_err();
        assert_eq!(err, FitError::NotConverged { iterations: 1 });
    }

    #[test]
    fn minimize_reports_unconverged_state() {
        let model = Model::build("A*exp(-k*x)", "x").unwrap();
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|xi| 3.0 * (-0.7 * xi).exp()).collect();
        let problem = CurveResiduals {
            model: &model,
            x: &x,
            y: &y,
            weights: None,
        };

        let start = DVector::from_vec(vec![1.0, 1.0]);
        let initial_chi = problem.residuals(&start).unwrap().norm_squared();
        let minimum = minimize(&problem, start, 2).unwrap();
        assert!(!minimum.converged);
        assert_eq!(minimum.iterations, 2);
        assert!(minimum.chi_square < initial_chi);
    }

    #[test]
    fn zero_sigma_is_rejected() {
        let err = least_squares(&linear(), &[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], Some(&[0.1, 0.0, 0.1]), &[1.0, 1.0])
            .unwrap_err();
        assert_eq!(err, FitError::ZeroUncertainty { column: "sy", row: 1 });
    }

    #[test]
    fn redundant_parameters_have_no_covariance() {
        let model = Model::build("a*b*x", "x").unwrap();
        let err = least_squares(&model, &[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0], None, &[1.0, 1.0]).unwrap_err();
        assert_eq!(err, FitError::SingularCovariance);
    }

    #[test]
    fn invalid_start_is_reported() {
        let model = Model::build("a*log(x)", "x").unwrap();
        let err = least_squares(&model, &[-1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], None, &[1.0]).unwrap_err();
        assert_eq!(err, FitError::NumericInvalid { row: 0 });
    }
}
