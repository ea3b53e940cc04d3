use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nalgebra::DMatrix;
use serde::Serialize;

use crate::data::Dataset;
use crate::error::{FitError, Warning};
use crate::expression::Model;
use crate::stats;
use crate::FitStrategy;

use super::diagnostics::{self, ResidualSummary};
use super::RawFit;

/// Significant digits used when a value is shown on its own.
pub(crate) const DISPLAY_DIGITS: usize = 8;

/// One fitted parameter with its 1σ uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterEstimate {
    pub name: String,
    pub value: f64,
    pub uncertainty: f64,
    /// Uncertainty rescaled by `sqrt(chi² / dof)`; only for unweighted fits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaled_uncertainty: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FitReport {
    pub(crate) expression: String,
    pub(crate) strategy: FitStrategy,
    pub(crate) rows: usize,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) parameters: Vec<ParameterEstimate>,
    pub(crate) covariance: DMatrix<f64>,
    pub(crate) correlation: DMatrix<f64>,
    pub(crate) dof: usize,
    pub(crate) chi_square: f64,
    pub(crate) p_value: Option<f64>,
    pub(crate) iterations: usize,
    pub(crate) residuals: ResidualSummary,
    pub(crate) derived_sy: Option<Vec<f64>>,
    pub(crate) x_corrections: Option<Vec<f64>>,
    pub(crate) valid: bool,
    pub(crate) notes: Vec<String>,
    pub(crate) warnings: Vec<Warning>,
}

pub(crate) fn build(
    model: &Model,
    view: &Dataset,
    strategy: FitStrategy,
    raw: RawFit,
) -> Result<FitReport, FitError> {
    let rows = view.len();
    let count = model.parameter_count();
    if rows <= count {
        return Err(FitError::InsufficientData {
            rows,
            parameters: count,
        });
    }
    let dof = rows - count;

    let valid = raw.covariance.is_some();
    let covariance = raw
        .covariance
        .unwrap_or_else(|| DMatrix::from_element(count, count, f64::NAN));
    let correlation = diagnostics::correlation(&covariance);

    let scale = strategy
        .uses_consistency_scaling()
        .then(|| (raw.chi_square / dof as f64).sqrt());
    // An unweighted sum of squares has no chi-square distribution to test against.
    let p_value = if strategy.uses_consistency_scaling() {
        None
    } else {
        stats::chi_square_p_value(raw.chi_square, dof)
    };

    let parameters = model
        .parameter_names()
        .iter()
        .zip(&raw.params)
        .enumerate()
        .map(|(i, (name, &value))| {
            let uncertainty = covariance[(i, i)].sqrt();
            ParameterEstimate {
                name: name.clone(),
                value,
                uncertainty,
                scaled_uncertainty: scale.map(|s| s * uncertainty),
            }
        })
        .collect();

    let fitted = model.evaluate_checked(view.x(), &raw.params)?;
    let residuals: Vec<f64> = view.y().iter().zip(&fitted).map(|(y, f)| y - f).collect();

    let mut notes = Vec::new();
    match strategy {
        FitStrategy::WeightedLeastSquares if view.has_sx() => {
            notes.push("Weighted by sy; the sx column was not used.".to_string())
        }
        FitStrategy::WeightedLeastSquares => notes.push("Weighted by sy.".to_string()),
        FitStrategy::UnweightedLeastSquares => notes.push(
            "No uncertainties applied; scaled uncertainties use sqrt(chi²/dof).".to_string(),
        ),
        FitStrategy::Orthogonal => {
            notes.push("Orthogonal distance regression weighted by sx and sy.".to_string())
        }
        FitStrategy::SymmetrizedOrthogonal => notes.push(
            "sx propagated into an effective sy; chi² uses the derived uncertainty.".to_string(),
        ),
    }
    if !valid {
        notes.push("Covariance matrix is singular; uncertainties are unavailable.".to_string());
    }

    Ok(FitReport {
        expression: model.text().to_string(),
        strategy,
        rows,
        timestamp: Utc::now(),
        parameters,
        covariance,
        correlation,
        dof,
        chi_square: raw.chi_square,
        p_value,
        iterations: raw.iterations,
        residuals: diagnostics::summarize_residuals(&residuals),
        derived_sy: raw.derived_sy,
        x_corrections: raw.x_corrections,
        valid,
        notes,
        warnings: raw.warnings,
    })
}

impl FitReport {
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn strategy(&self) -> FitStrategy {
        self.strategy
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn parameters(&self) -> &[ParameterEstimate] {
        &self.parameters
    }

    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn correlation(&self) -> &DMatrix<f64> {
        &self.correlation
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    /// Weighted chi-square, or the plain sum of squares for unweighted fits.
    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    pub fn reduced_chi_square(&self) -> f64 {
        self.chi_square / self.dof as f64
    }

    /// `P(χ² ≥ observed)` for weighted fits.
    pub fn p_value(&self) -> Option<f64> {
        self.p_value
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn residuals(&self) -> &ResidualSummary {
        &self.residuals
    }

    /// Effective y uncertainty of each fitted row, for the symmetrized fit.
    pub fn derived_sy(&self) -> Option<&[f64]> {
        self.derived_sy.as_deref()
    }

    /// Per-row x corrections found by the orthogonal backends.
    pub fn x_corrections(&self) -> Option<&[f64]> {
        self.x_corrections.as_deref()
    }

    /// `false` when the fit ran but its covariance could not be computed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Fit: y = {}", self.expression));
        lines.push(format!("Method: {}", self.strategy));
        lines.push(format!("Rows: {}", self.rows));
        lines.push(format!(
            "Generated at: {}",
            self.timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        ));

        lines.push(String::new());
        lines.push(format!("DoF = {}", self.dof));
        lines.push(format!("Chi² = {:.6}", self.chi_square));
        lines.push(format!("Reduced Chi² = {:.6}", self.reduced_chi_square()));
        if let Some(p) = self.p_value {
            lines.push(format!("P(Chi² >= observed) = {}", significant(p, 4)));
        }

        lines.push(String::new());
        lines.push("Parameters:".to_string());
        for param in &self.parameters {
            let mut line = format!(
                "  {:<10} {:>16} ± {}",
                param.name,
                significant(param.value, DISPLAY_DIGITS),
                significant(param.uncertainty, DISPLAY_DIGITS)
            );
            if let Some(scaled) = param.scaled_uncertainty {
                line.push_str(&format!(
                    "  (scaled ± {})",
                    significant(scaled, DISPLAY_DIGITS)
                ));
            }
            lines.push(line);
        }

        lines.push(String::new());
        lines.push("Covariance matrix:".to_string());
        lines.extend(matrix_lines(&self.covariance, |v| {
            format!("{:>14}", significant(v, 6))
        }));

        lines.push(String::new());
        lines.push("Correlation matrix:".to_string());
        lines.extend(matrix_lines(&self.correlation, |v| format!("{:>8.3}", v)));

        lines.push(String::new());
        lines.push("Residuals:".to_string());
        lines.push(format!(
            "  mean={} std={} min={} max={} max|r|={}",
            significant(self.residuals.mean, 6),
            significant(self.residuals.std_dev, 6),
            significant(self.residuals.min, 6),
            significant(self.residuals.max, 6),
            significant(self.residuals.max_abs, 6)
        ));

        if let Some(derived) = &self.derived_sy {
            let shown: Vec<String> = derived.iter().map(|v| significant(*v, 6)).collect();
            lines.push(format!("  derived sy: [{}]", shown.join(", ")));
        }

        if !self.notes.is_empty() || !self.warnings.is_empty() {
            lines.push(String::new());
            lines.push("Notes:".to_string());
            for note in &self.notes {
                lines.push(format!("  - {}", note));
            }
            for warning in &self.warnings {
                lines.push(format!("  - warning: {}", warning));
            }
        }

        lines.join("\n")
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render())
            .with_context(|| format!("failed to write report to {}", path.display()))
    }
}

/// The model evaluated at the initial guess, with no solver run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub expression: String,
    pub rows: usize,
    pub parameters: Vec<(String, f64)>,
    /// `y - f(x)` for every evaluated row.
    pub residuals: Vec<f64>,
    pub curve: Vec<(f64, f64)>,
}

impl Evaluation {
    pub fn values(&self) -> Vec<f64> {
        self.parameters.iter().map(|(_, value)| *value).collect()
    }

    pub fn render(&self) -> String {
        let summary = diagnostics::summarize_residuals(&self.residuals);
        let sum_of_squares: f64 = self.residuals.iter().map(|r| r * r).sum();

        let mut lines = vec![
            format!("Evaluation: y = {}", self.expression),
            "Method: none (initial guess)".to_string(),
            format!("Rows: {}", self.rows),
            String::new(),
            "Parameters:".to_string(),
        ];
        for (name, value) in &self.parameters {
            lines.push(format!(
                "  {:<10} {:>16}",
                name,
                significant(*value, DISPLAY_DIGITS)
            ));
        }
        lines.push(String::new());
        lines.push(format!("Sum of squared residuals = {:.6}", sum_of_squares));
        lines.push(format!(
            "  mean={} max|r|={}",
            significant(summary.mean, 6),
            significant(summary.max_abs, 6)
        ));
        lines.join("\n")
    }
}

fn matrix_lines(matrix: &DMatrix<f64>, cell: impl Fn(f64) -> String) -> Vec<String> {
    matrix
        .row_iter()
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|v| cell(*v)).collect();
            format!("  [{} ]", cells.join(""))
        })
        .collect()
}

/// Formats with `digits` significant digits, switching to exponent form for
/// very large or very small magnitudes.
pub(crate) fn significant(value: f64, digits: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let digits = digits.max(1);
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= digits as i32 {
        let text = format!("{:.*e}", digits - 1, value);
        match text.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{}", trim_zeros(mantissa), exp),
            None => text,
        }
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}
