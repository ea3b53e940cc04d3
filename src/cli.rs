use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::expression::DEFAULT_VARIABLE;
use crate::stats::{Distribution, Limits};

/// Command-line interface definition for datafit.
#[derive(Parser, Debug)]
#[command(
    name = "datafit",
    version,
    about = "Fit experimental data with uncertainties to symbolic models"
)]
pub struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fit a model to a data file (x, y[, sy[, sx]] columns).
    Fit(FitArgs),
    /// Load a saved project, refit it and print the report.
    Project(ProjectArgs),
    /// Confidence limits of the chi-square, Gaussian or Student t distribution.
    Stats(StatsArgs),
}

#[derive(Args, Debug)]
pub struct FitArgs {
    /// Data file: `.csv` is comma separated, anything else tab/space.
    /// Use `-` to read tab/space separated rows from stdin.
    #[arg(value_name = "DATASET")]
    pub dataset: PathBuf,

    /// Model expression, e.g. "A*exp(-k*x) + c".
    #[arg(short, long, value_name = "EXPR")]
    pub expr: String,

    /// Independent variable of the expression.
    #[arg(long, value_name = "NAME", default_value = DEFAULT_VARIABLE)]
    pub var: String,

    /// Initial guesses, separated by `,`, `;` or `/`.
    #[arg(long, value_name = "VALUES", default_value = "")]
    pub p0: String,

    /// Weight by the x uncertainty column.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    pub wsx: bool,

    /// Weight by the y uncertainty column.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    pub wsy: bool,

    /// Only fit rows with x at or above this value.
    #[arg(long, value_name = "X", allow_negative_numbers = true)]
    pub xmin: Option<f64>,

    /// Only fit rows with x at or below this value.
    #[arg(long, value_name = "X", allow_negative_numbers = true)]
    pub xmax: Option<f64>,

    /// Tab/space separated rows to append to the dataset before fitting.
    #[arg(long, value_name = "PATH")]
    pub append: Option<PathBuf>,

    /// Write the report to this location as well as stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Write the fitted curve as CSV.
    #[arg(long, value_name = "PATH")]
    pub curve: Option<PathBuf>,

    /// Save data and fit settings as a project document.
    #[arg(long, value_name = "PATH")]
    pub save_project: Option<PathBuf>,

    /// Evaluate the model at the initial guess instead of fitting it.
    #[arg(long)]
    pub no_fit: bool,

    /// Preview configuration without executing the solver.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct ProjectArgs {
    /// Project document, current or pre-versioning format.
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Write the project in the current format to this location.
    #[arg(long, value_name = "PATH")]
    pub upgrade: Option<PathBuf>,

    /// Write the report to this location as well as stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Write the fitted curve as CSV.
    #[arg(long, value_name = "PATH")]
    pub curve: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[arg(value_enum, value_name = "DISTRIBUTION")]
    pub distribution: Distribution,

    /// Which side(s) the confidence level covers.
    #[arg(long, value_enum, default_value_t = Limits::TwoSided)]
    pub limits: Limits,

    /// Confidence level as a probability (0.95) or a percentage (95).
    #[arg(short, long, default_value_t = 0.95)]
    pub confidence: f64,

    /// Degrees of freedom (chi-square and Student t).
    #[arg(long)]
    pub dof: Option<f64>,

    /// Mean (Gaussian and Student t).
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub mean: f64,

    /// Standard deviation (Gaussian and Student t).
    #[arg(long, default_value_t = 1.0)]
    pub std: f64,
}
