//! Fit strategy selection and the fit driver.

mod diagnostics;
mod odr;
mod report;
mod solve;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::Dataset;
use crate::error::{FitError, Warning};
use crate::expression::Model;
use crate::FitStrategy;

pub use diagnostics::{prediction_curve, ResidualSummary};
pub use report::{Evaluation, FitReport, ParameterEstimate};
pub(crate) use report::significant;

/// Output of one regression backend before it is turned into a report.
#[derive(Debug, Clone)]
pub(crate) struct RawFit {
    pub(crate) params: Vec<f64>,
    /// `None` when the backend could not invert its normal matrix.
    pub(crate) covariance: Option<DMatrix<f64>>,
    pub(crate) chi_square: f64,
    pub(crate) iterations: usize,
    pub(crate) derived_sy: Option<Vec<f64>>,
    pub(crate) x_corrections: Option<Vec<f64>>,
    pub(crate) warnings: Vec<Warning>,
}

/// User-controlled fit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Comma, semicolon or slash separated starting values.
    pub initial_guess: String,
    /// Weight by the x uncertainty.
    pub wsx: bool,
    /// Weight by the y uncertainty.
    pub wsy: bool,
    pub xmin: Option<f64>,
    pub xmax: Option<f64>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            initial_guess: String::new(),
            wsx: true,
            wsy: true,
            xmin: None,
            xmax: None,
        }
    }
}

/// Picks the backend for a dataset's uncertainty flags and the weighting
/// toggles.
///
/// With both uncertainties present and both toggles set, the fit degrades
/// to unweighted least squares; `wsx && !wsy` weights by sy alone. With only
/// sx present, `wsx` also falls through to unweighted least squares.
pub fn select_strategy(has_sx: bool, has_sy: bool, wsx: bool, wsy: bool) -> FitStrategy {
    let strategy = match (has_sy, has_sx) {
        (true, true) => match (wsx, wsy) {
            (true, true) => FitStrategy::UnweightedLeastSquares,
            (true, false) => FitStrategy::WeightedLeastSquares,
            (false, true) => FitStrategy::SymmetrizedOrthogonal,
            (false, false) => FitStrategy::Orthogonal,
        },
        (true, false) if wsy => FitStrategy::WeightedLeastSquares,
        (true, false) => FitStrategy::UnweightedLeastSquares,
        (false, true) if wsx => FitStrategy::UnweightedLeastSquares,
        (false, true) => FitStrategy::SymmetrizedOrthogonal,
        (false, false) => FitStrategy::UnweightedLeastSquares,
    };

    debug!(has_sx, has_sy, wsx, wsy, %strategy, "selected fit strategy");
    strategy
}

/// Parses one starting value per parameter. Entries that are missing or do
/// not parse become `1.0`.
pub fn parse_initial_guess(text: &str, count: usize) -> Vec<f64> {
    let normalized = text.replace([';', '/'], ",");
    let mut entries = normalized.split(',').map(str::trim);

    (0..count)
        .map(|_| {
            entries
                .next()
                .and_then(|entry| entry.parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .unwrap_or(1.0)
        })
        .collect()
}

/// Fits `model` to the rows of `dataset` inside the options' x range.
pub fn fit(dataset: &Dataset, model: &Model, options: &FitOptions) -> Result<FitReport, FitError> {
    if dataset.is_empty() {
        return Err(FitError::NoData);
    }

    let view = fit_view(dataset, options)?;

    let parameters = model.parameter_count();
    if view.len() <= parameters {
        return Err(FitError::InsufficientData {
            rows: view.len(),
            parameters,
        });
    }

    let strategy = select_strategy(view.has_sx(), view.has_sy(), options.wsx, options.wsy);
    let initial = parse_initial_guess(&options.initial_guess, parameters);
    info!(%strategy, rows = view.len(), expression = model.text(), "fitting");

    let raw = match strategy {
        FitStrategy::WeightedLeastSquares => {
            solve::least_squares(model, view.x(), view.y(), Some(view.sy()), &initial)?
        }
        FitStrategy::UnweightedLeastSquares => {
            solve::least_squares(model, view.x(), view.y(), None, &initial)?
        }
        FitStrategy::Orthogonal => {
            odr::orthogonal(model, view.x(), view.y(), view.sx(), view.sy(), &initial)?
        }
        FitStrategy::SymmetrizedOrthogonal => {
            odr::symmetrized(model, view.x(), view.y(), view.sx(), &initial)?
        }
    };

    report::build(model, &view, strategy, raw)
}

/// Evaluates `model` at the parsed initial guess over the rows inside the
/// options' x range, without running a solver. The curve has
/// `samples_per_row` points per evaluated row.
pub fn evaluate_initial(
    dataset: &Dataset,
    model: &Model,
    options: &FitOptions,
    samples_per_row: usize,
) -> Result<Evaluation, FitError> {
    if dataset.is_empty() {
        return Err(FitError::NoData);
    }
    let view = fit_view(dataset, options)?;
    let values = parse_initial_guess(&options.initial_guess, model.parameter_count());

    let predicted = model.evaluate_checked(view.x(), &values)?;
    let residuals = view.y().iter().zip(&predicted).map(|(y, f)| y - f).collect();
    let curve = view.x_bounds().map_or_else(Vec::new, |bounds| {
        prediction_curve(model, &values, bounds, samples_per_row * view.len())
    });
    info!(rows = view.len(), expression = model.text(), "evaluated model at initial guess");

    Ok(Evaluation {
        expression: model.text().to_string(),
        rows: view.len(),
        parameters: model
            .parameter_names()
            .iter()
            .cloned()
            .zip(values)
            .collect(),
        residuals,
        curve,
    })
}

fn fit_view(dataset: &Dataset, options: &FitOptions) -> Result<Dataset, FitError> {
    let view = dataset.within(options.xmin, options.xmax);
    if view.is_empty() {
        return Err(FitError::EmptyRange {
            xmin: options.xmin.unwrap_or(f64::NEG_INFINITY),
            xmax: options.xmax.unwrap_or(f64::INFINITY),
        });
    }
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use approx::assert_abs_diff_eq;

    #[test]
    fn selector_matches_truth_table() {
        use FitStrategy::*;

        // (has_sy, has_sx, wsx, wsy) -> backend
        let table = [
            ((true, true, true, true), UnweightedLeastSquares),
            ((true, true, true, false), WeightedLeastSquares),
            ((true, true, false, true), SymmetrizedOrthogonal),
            ((true, true, false, false), Orthogonal),
            ((true, false, true, true), WeightedLeastSquares),
            ((true, false, false, true), WeightedLeastSquares),
            ((true, false, true, false), UnweightedLeastSquares),
            ((true, false, false, false), UnweightedLeastSquares),
            ((false, true, true, true), UnweightedLeastSquares),
            ((false, true, true, false), UnweightedLeastSquares),
            ((false, true, false, true), SymmetrizedOrthogonal),
            ((false, true, false, false), SymmetrizedOrthogonal),
            ((false, false, true, true), UnweightedLeastSquares),
            ((false, false, true, false), UnweightedLeastSquares),
            ((false, false, false, true), UnweightedLeastSquares),
            ((false, false, false, false), UnweightedLeastSquares),
        ];

        for ((has_sy, has_sx, wsx, wsy), expected) in table {
            assert_eq!(
                select_strategy(has_sx, has_sy, wsx, wsy),
                expected,
                "has_sy={has_sy} has_sx={has_sx} wsx={wsx} wsy={wsy}"
            );
        }
    }

    #[test]
    fn both_uncertainties_with_default_toggles_fit_unweighted() {
        let text = "1 2.1 0.1 0.05\n2 3.9 0.1 0.05\n3 6.2 0.2 0.05\n4 8.1 0.1 0.05\n";
        let dataset = data::from_text(text).unwrap().dataset;
        let model = Model::with_neutral_term("a*x + b", "x").unwrap();

        let report = fit(&dataset, &model, &FitOptions::default()).unwrap();
        assert_eq!(report.strategy(), FitStrategy::UnweightedLeastSquares);
        assert!(report.parameters()[0].scaled_uncertainty.is_some());

        let sy_only = FitOptions {
            wsy: false,
            ..FitOptions::default()
        };
        let report = fit(&dataset, &model, &sy_only).unwrap();
        assert_eq!(report.strategy(), FitStrategy::WeightedLeastSquares);
    }

    #[test]
    fn initial_guess_accepts_mixed_separators() {
        assert_eq!(parse_initial_guess("2; 3/4", 3), vec![2.0, 3.0, 4.0]);
        assert_eq!(parse_initial_guess("", 2), vec![1.0, 1.0]);
        assert_eq!(parse_initial_guess("5,abc", 3), vec![5.0, 1.0, 1.0]);
        assert_eq!(parse_initial_guess("1,2,3", 2), vec![1.0, 2.0]);
    }

    #[test]
    fn x_range_limits_the_fitted_rows() {
        let dataset = data::from_text("0 0\n1 2\n2 4\n3 6\n10 100\n").unwrap().dataset;
        let model = Model::with_neutral_term("a*x + b", "x").unwrap();
        let options = FitOptions {
            xmax: Some(3.0),
            ..FitOptions::default()
        };

        let report = fit(&dataset, &model, &options).unwrap();
        assert_eq!(report.rows(), 4);
        assert_eq!(report.dof(), 2);
        assert_abs_diff_eq!(report.values()[0], 2.0, epsilon = 1e-8);
        assert_eq!(dataset.len(), 5);
    }

    #[test]
    fn initial_guess_is_evaluated_without_fitting() {
        let dataset = data::from_text("0 1\n1 3\n2 5\n").unwrap().dataset;
        let model = Model::with_neutral_term("a*x + b", "x").unwrap();
        let options = FitOptions {
            initial_guess: "2; 0".to_string(),
            ..FitOptions::default()
        };

        let evaluation = evaluate_initial(&dataset, &model, &options, 10).unwrap();
        assert_eq!(evaluation.values(), vec![2.0, 0.0]);
        assert_eq!(evaluation.residuals, vec![1.0, 1.0, 1.0]);
        assert_eq!(evaluation.curve.len(), 30);
        assert_abs_diff_eq!(evaluation.curve[29].1, 4.0);

        let text = evaluation.render();
        assert!(text.contains("Evaluation: y = a*x + b"));
        assert!(text.contains("Sum of squared residuals = 3.000000"));
    }

    #[test]
    fn empty_range_is_an_error() {
        let dataset = data::from_text("0 0\n1 2\n2 4\n").unwrap().dataset;
        let model = Model::with_neutral_term("a*x", "x").unwrap();
        let options = FitOptions {
            xmin: Some(10.0),
            ..FitOptions::default()
        };

        let err = fit(&dataset, &model, &options).unwrap_err();
        assert!(matches!(err, FitError::EmptyRange { .. }));
    }

    #[test]
    fn too_few_rows_is_insufficient_data() {
        let dataset = data::from_text("0 1\n1 3\n").unwrap().dataset;
        let model = Model::with_neutral_term("a*x + b", "x").unwrap();

        let err = fit(&dataset, &model, &FitOptions::default()).unwrap_err();
        assert_eq!(
            err,
            FitError::InsufficientData {
                rows: 2,
                parameters: 2
            }
        );
    }
}
