//! Symbolic fit models.
//!
//! A [`Model`] is built from user text over one independent variable; every
//! other name in the text becomes a fit parameter.

mod parser;

use tracing::debug;

use crate::error::{ExpressionError, FitError};

use parser::{Node, Parser};

pub const DEFAULT_VARIABLE: &str = "x";

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    text: String,
    variable: String,
    root: Node,
    parameters: Vec<String>,
}

impl Model {
    /// Parses `text` as a function of `variable`. The variable must appear
    /// in the expression and there must be at least one parameter.
    pub fn build(text: &str, variable: &str) -> Result<Self, ExpressionError> {
        let model = Self::compile(text, text, variable)?;
        if !model.root.uses_variable() {
            return Err(ExpressionError::MissingVariable {
                name: variable.to_string(),
            });
        }
        Ok(model)
    }

    /// Like [`Model::build`], but appends `+ 0*variable` first so models that
    /// do not mention the variable (a constant `c`, say) still evaluate to
    /// one value per x.
    pub fn with_neutral_term(text: &str, variable: &str) -> Result<Self, ExpressionError> {
        let source = format!("{} + 0*{}", text, variable);
        // The appended term would otherwise complete a dangling operator
        // such as "a*x +".
        Parser::parse(text, variable)?;
        Self::compile(&source, text, variable)
    }

    fn compile(source: &str, text: &str, variable: &str) -> Result<Self, ExpressionError> {
        if !parser::is_identifier(variable) {
            return Err(ExpressionError::InvalidVariable {
                name: variable.to_string(),
            });
        }

        let parsed = Parser::parse(source, variable)?;
        if parsed.parameters.is_empty() {
            return Err(ExpressionError::NoParameters);
        }

        debug!(expression = text, parameters = ?parsed.parameters, "built model");

        Ok(Self {
            text: text.trim().to_string(),
            variable: variable.to_string(),
            root: parsed.root,
            parameters: parsed.parameters,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameters
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn evaluate_at(&self, x: f64, params: &[f64]) -> f64 {
        self.root.eval(x, params)
    }

    /// Evaluates over every x. Values may be NaN or infinite where the
    /// expression blows up.
    pub fn evaluate(&self, x: &[f64], params: &[f64]) -> Vec<f64> {
        x.iter().map(|&xi| self.root.eval(xi, params)).collect()
    }

    /// Evaluates over every x and rejects the first non-finite value.
    pub fn evaluate_checked(&self, x: &[f64], params: &[f64]) -> Result<Vec<f64>, FitError> {
        let values = self.evaluate(x, params);
        match values.iter().position(|value| !value.is_finite()) {
            Some(row) => Err(FitError::NumericInvalid { row }),
            None => Ok(values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn exposes_parameter_names() {
        let model = Model::build("A*exp(-k*t) + c", "t").unwrap();
        assert_eq!(model.parameter_names(), &["A", "k", "c"]);
        assert_eq!(model.variable(), "t");
    }

    #[test]
    fn evaluates_vectorized() {
        let model = Model::build("a*x + b", "x").unwrap();
        let y = model.evaluate(&[0.0, 1.0, 2.0], &[2.0, 1.0]);
        assert_eq!(y, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn blow_up_is_reported_not_raised() {
        let model = Model::build("a/x", "x").unwrap();
        let raw = model.evaluate(&[1.0, 0.0], &[1.0]);
        assert!(raw[1].is_infinite());

        let err = model.evaluate_checked(&[1.0, 0.0], &[1.0]).unwrap_err();
        assert_eq!(err, FitError::NumericInvalid { row: 1 });
    }

    #[test]
    fn build_requires_variable() {
        let err = Model::build("a + b", "x").unwrap_err();
        assert!(matches!(err, ExpressionError::MissingVariable { .. }));
    }

    #[test]
    fn neutral_term_accepts_constant_models() {
        let model = Model::with_neutral_term("c", "x").unwrap();
        assert_eq!(model.parameter_names(), &["c"]);
        assert_eq!(model.text(), "c");
        let y = model.evaluate(&[1.0, 2.0, 3.0], &[4.0]);
        assert_eq!(y, vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn malformed_text_is_a_syntax_error() {
        let err = Model::with_neutral_term("a+*b", "x").unwrap_err();
        assert!(matches!(err, ExpressionError::Syntax { position: 2, .. }));
    }

    #[test]
    fn parameterless_models_are_rejected() {
        assert_eq!(
            Model::build("2*x", "x").unwrap_err(),
            ExpressionError::NoParameters
        );
    }

    #[test]
    fn invalid_variable_name() {
        let err = Model::build("a*x", "1x").unwrap_err();
        assert!(matches!(err, ExpressionError::InvalidVariable { .. }));
    }

    #[test]
    fn power_operator_spellings_agree() {
        let caret = Model::build("a*x^2", "x").unwrap();
        let stars = Model::build("a*x**2", "x").unwrap();
        assert_abs_diff_eq!(caret.evaluate_at(3.0, &[2.0]), 18.0);
        assert_abs_diff_eq!(stars.evaluate_at(3.0, &[2.0]), 18.0);
    }
}
