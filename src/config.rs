use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

use crate::cli::FitArgs;
use crate::fit::FitOptions;

/// `DATASET` value that reads from stdin.
pub const STDIN_DATASET: &str = "-";

/// Runtime configuration compiled from CLI input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: PathBuf,
    pub expression: String,
    pub variable: String,
    pub options: FitOptions,
    pub append: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub curve: Option<PathBuf>,
    pub save_project: Option<PathBuf>,
    pub no_fit: bool,
    pub dry_run: bool,
}

impl RunConfig {
    pub fn from_fit_args(args: FitArgs) -> Self {
        Self {
            dataset: args.dataset,
            expression: args.expr,
            variable: args.var,
            options: FitOptions {
                initial_guess: args.p0,
                wsx: args.wsx,
                wsy: args.wsy,
                xmin: args.xmin,
                xmax: args.xmax,
            },
            append: args.append,
            output: args.output,
            curve: args.curve,
            save_project: args.save_project,
            no_fit: args.no_fit,
            dry_run: args.dry_run,
        }
    }

    pub fn reads_stdin(&self) -> bool {
        self.dataset == Path::new(STDIN_DATASET)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.expression.trim().is_empty(),
            "a model expression must be provided"
        );
        ensure!(
            !self.variable.trim().is_empty(),
            "the independent variable name must not be empty"
        );

        if let (Some(lo), Some(hi)) = (self.options.xmin, self.options.xmax) {
            ensure!(lo <= hi, "--xmin ({}) must not exceed --xmax ({})", lo, hi);
        }

        if self.dry_run {
            return Ok(());
        }

        if !self.reads_stdin() && !self.dataset.exists() {
            bail!(
                "Dataset '{}' does not exist; use --dry-run to preview without the file",
                self.dataset.display()
            );
        }
        if let Some(append) = &self.append {
            if !append.exists() {
                bail!("Append file '{}' does not exist", append.display());
            }
        }

        Ok(())
    }

    pub fn summary(&self) -> String {
        let range = match (self.options.xmin, self.options.xmax) {
            (None, None) => "all rows".to_string(),
            (lo, hi) => format!(
                "{} <= {} <= {}",
                lo.map_or("-inf".to_string(), |v| v.to_string()),
                self.variable,
                hi.map_or("inf".to_string(), |v| v.to_string())
            ),
        };

        format!(
            concat!(
                "Model: y = {}\n",
                "Variable: {}\n",
                "Dataset: {}\n",
                "Initial guess: {}\n",
                "Weight by sx: {}\n",
                "Weight by sy: {}\n",
                "Range: {}\n",
                "Mode: {}"
            ),
            self.expression,
            self.variable,
            if self.reads_stdin() {
                "<stdin>".to_string()
            } else {
                self.dataset.display().to_string()
            },
            if self.options.initial_guess.trim().is_empty() {
                "<defaults>"
            } else {
                self.options.initial_guess.as_str()
            },
            self.options.wsx,
            self.options.wsy,
            range,
            if self.no_fit {
                "evaluate at initial guess"
            } else {
                "fit"
            }
        )
    }
}
