mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod expression;
pub mod fit;
pub mod project;
pub mod session;
pub mod stats;

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use cli::{Cli, Commands, FitArgs, ProjectArgs, StatsArgs};
use project::Project;
use session::{Event, Session};

pub use error::{Error, ErrorKind, Warning};

/// The regression backend a fit runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStrategy {
    WeightedLeastSquares,
    UnweightedLeastSquares,
    Orthogonal,
    SymmetrizedOrthogonal,
}

impl FitStrategy {
    pub fn label(self) -> &'static str {
        match self {
            FitStrategy::WeightedLeastSquares => "weighted least squares",
            FitStrategy::UnweightedLeastSquares => "unweighted least squares",
            FitStrategy::Orthogonal => "orthogonal distance regression",
            FitStrategy::SymmetrizedOrthogonal => "symmetrized orthogonal distance regression",
        }
    }

    /// Unweighted fits also report uncertainties scaled by `sqrt(chi²/dof)`.
    pub fn uses_consistency_scaling(self) -> bool {
        matches!(self, FitStrategy::UnweightedLeastSquares)
    }
}

impl std::fmt::Display for FitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Fit(args) => handle_fit(args),
        Commands::Project(args) => handle_project(args),
        Commands::Stats(args) => handle_stats(args),
    }
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let config = config::RunConfig::from_fit_args(args);
    config.validate()?;

    println!("--> Configuration\n{}", config.summary());

    if config.dry_run {
        println!("\nDry run requested: skipping solver execution.");
        return Ok(());
    }

    let mut session = Session::new();
    if config.reads_stdin() {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read dataset from stdin")?;
        session.load_text(&text)?;
    } else {
        session.load_path(&config.dataset)?;
    }

    if let Some(path) = &config.append {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read rows to append from {}", path.display()))?;
        session.append_text(&text)?;
    }

    session.set_expression(&config.expression, &config.variable)?;
    session.set_options(config.options.clone());

    if config.no_fit {
        let outcome = session.evaluate_initial();
        print_events(&mut session);
        let evaluation = outcome?;
        println!("\n--> Evaluation\n{}", evaluation.render());

        if let Some(path) = &config.output {
            fs::write(path, evaluation.render())
                .with_context(|| format!("failed to write evaluation to {}", path.display()))?;
            println!("\nEvaluation written to {}", path.display());
        }
        if let Some(path) = &config.curve {
            write_curve(path, &evaluation.curve)?;
            println!("Curve written to {}", path.display());
        }
    } else {
        let outcome = session.fit().map(|_| ());
        print_events(&mut session);
        outcome?;

        write_outputs(&session, config.output.as_deref(), config.curve.as_deref())?;
    }

    if let Some(path) = &config.save_project {
        let id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        session.save_project(path, &id)?;
        println!("Project written to {}", path.display());
    }

    Ok(())
}

fn handle_project(args: ProjectArgs) -> Result<()> {
    let loaded = Project::load(&args.path)?;

    if let Some(path) = &args.upgrade {
        loaded.project.save(path)?;
        println!("Project written to {}", path.display());
    }

    let mut session = Session::new();
    session.restore_project(loaded)?;

    if session.model().is_none() {
        print_events(&mut session);
        println!("\nProject has no model expression; nothing to fit.");
        return Ok(());
    }

    let outcome = session.fit().map(|_| ());
    print_events(&mut session);
    outcome?;

    write_outputs(&session, args.output.as_deref(), args.curve.as_deref())
}

fn handle_stats(args: StatsArgs) -> Result<()> {
    let request = stats::Request {
        distribution: args.distribution,
        limits: args.limits,
        confidence: args.confidence,
        dof: args.dof,
        mean: args.mean,
        std: args.std,
    };
    let interval = stats::interval(&request).context("cannot compute confidence limits")?;
    println!("{}", interval.render());
    Ok(())
}

fn print_events(session: &mut Session) {
    for event in session.drain_events() {
        match event {
            Event::DataLoaded {
                origin,
                rows,
                has_sx,
                has_sy,
            } => println!(
                "Loaded {} rows from {} (sy: {}, sx: {})",
                rows,
                origin,
                if has_sy { "yes" } else { "no" },
                if has_sx { "yes" } else { "no" }
            ),
            Event::Warning(warning) => eprintln!("warning: {}", warning),
            Event::ParametersUpdated(_)
            | Event::ReportReady(_)
            | Event::EvaluationReady(_)
            | Event::Error { .. } => {}
        }
    }
}

fn write_outputs(session: &Session, output: Option<&Path>, curve: Option<&Path>) -> Result<()> {
    let report = session.report().context("no fit report is available")?;
    println!("\n--> Report\n{}", report.render());

    if let Some(path) = output {
        report.persist(path)?;
        println!("\nReport written to {}", path.display());
    }

    if let Some(path) = curve {
        let samples = session
            .prediction_curve()
            .context("no fitted curve is available")?;
        write_curve(path, &samples)?;
        println!("Curve written to {}", path.display());
    }

    Ok(())
}

fn write_curve(path: &Path, samples: &[(f64, f64)]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create curve file {}", path.display()))?;
    writer.write_record(["x", "y"])?;
    for (x, y) in samples {
        writer.write_record([x.to_string(), y.to_string()])?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write curve to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_labels() {
        assert_eq!(
            FitStrategy::SymmetrizedOrthogonal.to_string(),
            "symmetrized orthogonal distance regression"
        );
        assert!(FitStrategy::UnweightedLeastSquares.uses_consistency_scaling());
        assert!(!FitStrategy::WeightedLeastSquares.uses_consistency_scaling());
    }

    #[test]
    fn curve_is_written_as_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curve.csv");
        write_curve(&path, &[(0.0, 1.0), (0.5, 2.0)]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "x,y\n0,1\n0.5,2\n");
    }
}
