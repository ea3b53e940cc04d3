//! Error and warning types shared by every stage of the fitting pipeline.
//!
//! Errors abort the operation that raised them and leave the session state
//! as it was. Warnings are informational and travel alongside a successful
//! result.

use std::path::PathBuf;

/// Failures while turning raw input into a dataset.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file encoding is invalid; use utf-8")]
    Encoding,

    #[error("{expected}; check the input data")]
    Delimiter { expected: &'static str },

    #[error("found {found} columns, at most 4 are allowed (x, y, sy, sx); check the input data")]
    TooManyColumns { found: usize },

    #[error("no numeric rows left to load")]
    Empty,

    #[error("column '{column}' has {found} values, expected {expected}")]
    RaggedColumns {
        column: String,
        found: usize,
        expected: usize,
    },
}

/// Failures while building a model from its expression text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("independent variable '{name}' does not appear in the expression")]
    MissingVariable { name: String },

    #[error("'{name}' is not a valid variable name")]
    InvalidVariable { name: String },

    #[error("expression has no free parameters to fit")]
    NoParameters,
}

impl ExpressionError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        ExpressionError::Syntax {
            position,
            message: message.into(),
        }
    }
}

/// Failures raised by the regression backends and the report builder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("no data loaded")]
    NoData,

    #[error("no model expression set")]
    NoModel,

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("fit did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("fit did not converge: covariance matrix is singular")]
    SingularCovariance,

    #[error("model produced a non-finite value at row {row}")]
    NumericInvalid { row: usize },

    #[error("uncertainty '{column}' is zero at row {row}; cannot weight by it")]
    ZeroUncertainty { column: &'static str, row: usize },

    #[error("not enough data: {rows} rows for {parameters} parameters")]
    InsufficientData { rows: usize, parameters: usize },

    #[error("x range [{xmin}, {xmax}] leaves no rows to fit")]
    EmptyRange { xmin: f64, xmax: f64 },
}

/// Failures while reading, migrating or writing a project document.
#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("failed to access project '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed project document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("legacy project is missing field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Data(#[from] DataError),
}

/// Invalid inputs to the confidence-limit calculator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StatsError {
    #[error("confidence level {0} must lie strictly between 0 and 1 (or 0% and 100%)")]
    Confidence(f64),

    #[error("degrees of freedom must be a positive number, got {0}")]
    DegreesOfFreedom(f64),

    #[error("standard deviation must be greater than zero, got {0}")]
    StdDev(f64),

    #[error("invalid distribution parameters: {0}")]
    Distribution(String),
}

/// Every error the library surfaces, tagged by the stage that raised it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Stats(#[from] StatsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Data,
    Expression,
    Fit,
    Project,
    Stats,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Data(_) => ErrorKind::Data,
            Error::Expression(_) => ErrorKind::Expression,
            Error::Fit(_) => ErrorKind::Fit,
            Error::Project(_) => ErrorKind::Project,
            Error::Stats(_) => ErrorKind::Stats,
        }
    }
}

/// Non-blocking conditions reported next to a successful operation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Warning {
    #[error("rows with non-numeric values were removed")]
    NonNumericRowsRemoved,

    #[error("uncertainty column '{column}' is all zero; treating it as not measured")]
    ZeroUncertaintyColumn { column: &'static str },

    #[error("uncertainty column '{column}' contains zeros among nonzero values")]
    AmbiguousZeroUncertainty { column: &'static str },

    #[error("appended data must have more than one column; nothing was added")]
    AppendNeedsColumns,

    #[error("project was written by an older version and was adapted automatically")]
    LegacyProject,

    #[error("orthogonal regression stopped at the iteration limit ({limit})")]
    IterationLimit { limit: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
