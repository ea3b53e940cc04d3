//! The fitting session.
//!
//! A [`Session`] owns the active dataset, model and fit report. Every
//! operation either commits a complete new state or fails and leaves the
//! previous one in place; in both cases it queues [`Event`]s for the host to
//! drain.

use std::collections::VecDeque;
use std::path::Path;

use tracing::{info, warn};

use crate::data::{self, Dataset, Normalized, TableRow};
use crate::error::{Error, ErrorKind, FitError, Result, Warning};
use crate::expression::Model;
use crate::fit::{self, Evaluation, FitOptions, FitReport, ParameterEstimate};
use crate::project::{LoadedProject, Project, ProjectData};

/// Samples per data row in [`Session::prediction_curve`].
pub const CURVE_SAMPLES_PER_ROW: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DataLoaded {
        origin: String,
        rows: usize,
        has_sx: bool,
        has_sy: bool,
    },
    ParametersUpdated(Vec<ParameterEstimate>),
    ReportReady(String),
    /// Text of a model evaluated at its initial guess, no fit involved.
    EvaluationReady(String),
    Warning(Warning),
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Default)]
pub struct Session {
    dataset: Option<Dataset>,
    model: Option<Model>,
    report: Option<FitReport>,
    options: FitOptions,
    generation: u64,
    events: VecDeque<Event>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    pub fn report(&self) -> Option<&FitReport> {
        self.report.as_ref()
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: FitOptions) {
        self.options = options;
    }

    /// Bumped every time a new dataset is committed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Clears dataset, model, report and settings together.
    pub fn reset(&mut self) {
        self.dataset = None;
        self.model = None;
        self.report = None;
        self.options = FitOptions::default();
        info!("session reset");
    }

    pub fn load_path(&mut self, path: &Path) -> Result<&Dataset> {
        let origin = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match data::load_path(path) {
            Ok(normalized) => Ok(self.commit_dataset(normalized, origin)),
            Err(err) => self.fail(err),
        }
    }

    /// Clipboard-style text, columns separated by tabs or spaces.
    pub fn load_text(&mut self, text: &str) -> Result<&Dataset> {
        match data::from_text(text) {
            Ok(normalized) => Ok(self.commit_dataset(normalized, "clipboard".to_string())),
            Err(err) => self.fail(err),
        }
    }

    pub fn load_rows(&mut self, rows: &[TableRow]) -> Result<&Dataset> {
        match data::from_rows(rows) {
            Ok(normalized) => Ok(self.commit_dataset(normalized, "table".to_string())),
            Err(err) => self.fail(err),
        }
    }

    pub fn load_columns(&mut self, columns: &[(&str, Vec<String>)]) -> Result<&Dataset> {
        match data::from_columns(columns) {
            Ok(normalized) => Ok(self.commit_dataset(normalized, "columns".to_string())),
            Err(err) => self.fail(err),
        }
    }

    /// Appends clipboard-style rows to the current dataset.
    pub fn append_text(&mut self, text: &str) -> Result<&Dataset> {
        let outcome = match &self.dataset {
            Some(existing) => data::append_text(existing, text).map_err(Error::from),
            None => Err(FitError::NoData.into()),
        };

        match outcome {
            Ok(normalized) if normalized.warnings.contains(&Warning::AppendNeedsColumns) => {
                self.push_warnings(normalized.warnings);
                self.dataset.as_ref().ok_or(Error::Fit(FitError::NoData))
            }
            Ok(normalized) => Ok(self.commit_dataset(normalized, "clipboard".to_string())),
            Err(err) => self.fail(err),
        }
    }

    /// Builds the model for `text`. On failure the previous model stays.
    pub fn set_expression(&mut self, text: &str, variable: &str) -> Result<&Model> {
        match Model::with_neutral_term(text, variable) {
            Ok(model) => {
                if self.model.as_ref() != Some(&model) {
                    self.report = None;
                }
                Ok(self.model.insert(model))
            }
            Err(err) => self.fail(err),
        }
    }

    pub fn fit(&mut self) -> Result<&FitReport> {
        let outcome = match (&self.dataset, &self.model) {
            (None, _) => Err(FitError::NoData),
            (_, None) => Err(FitError::NoModel),
            (Some(dataset), Some(model)) => fit::fit(dataset, model, &self.options),
        };

        let report = match outcome {
            Ok(report) => report,
            Err(err) => return self.fail(err),
        };

        self.push_warnings(report.warnings().to_vec());
        self.events
            .push_back(Event::ParametersUpdated(report.parameters().to_vec()));
        self.events.push_back(Event::ReportReady(report.render()));
        info!(
            strategy = %report.strategy(),
            chi_square = report.chi_square(),
            "fit finished"
        );
        Ok(self.report.insert(report))
    }

    /// Evaluates the model at the current initial guess without fitting.
    /// Any existing report is kept.
    pub fn evaluate_initial(&mut self) -> Result<Evaluation> {
        let outcome = match (&self.dataset, &self.model) {
            (None, _) => Err(FitError::NoData),
            (_, None) => Err(FitError::NoModel),
            (Some(dataset), Some(model)) => {
                fit::evaluate_initial(dataset, model, &self.options, CURVE_SAMPLES_PER_ROW)
            }
        };

        match outcome {
            Ok(evaluation) => {
                self.events
                    .push_back(Event::EvaluationReady(evaluation.render()));
                Ok(evaluation)
            }
            Err(err) => self.fail(err),
        }
    }

    /// `y - f(x)` over every stored row with the fitted parameters.
    pub fn residuals(&self) -> Option<Vec<f64>> {
        let (dataset, model, report) = self.fitted()?;
        let predicted = model.evaluate(dataset.x(), &report.values());
        Some(dataset.y().iter().zip(&predicted).map(|(y, f)| y - f).collect())
    }

    /// The fitted curve sampled over the full x range of the data.
    pub fn prediction_curve(&self) -> Option<Vec<(f64, f64)>> {
        let (dataset, model, report) = self.fitted()?;
        let bounds = dataset.x_bounds()?;
        Some(fit::prediction_curve(
            model,
            &report.values(),
            bounds,
            CURVE_SAMPLES_PER_ROW * dataset.len(),
        ))
    }

    /// Captures the session as a project document.
    pub fn to_project(&self, id: &str) -> Result<Project> {
        let dataset = self.dataset.as_ref().ok_or(FitError::NoData)?;
        let mut project = Project::new(id, ProjectData::from_display(dataset.display()));

        project.fit_props.p0 = self.options.initial_guess.clone();
        project.fit_props.wsx = self.options.wsx;
        project.fit_props.wsy = self.options.wsy;
        if let Some(model) = &self.model {
            project.fit_props.expr = model.text().to_string();
            project.fit_props.var = model.variable().to_string();
        }
        if let Some(report) = &self.report {
            project.fit_props.parameters = report
                .parameters()
                .iter()
                .map(|p| (p.name.clone(), p.value))
                .collect();
        }
        Ok(project)
    }

    pub fn save_project(&mut self, path: &Path, id: &str) -> Result<()> {
        let outcome = self
            .to_project(id)
            .and_then(|project| project.save(path).map_err(Error::from));
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => self.fail(err),
        }
    }

    pub fn load_project(&mut self, path: &Path) -> Result<&Dataset> {
        match Project::load(path) {
            Ok(loaded) => self.restore_project(loaded),
            Err(err) => self.fail(err),
        }
    }

    /// Replaces dataset, model and fit settings with the project's. The
    /// stored parameter values seed the initial guess when `p0` is empty.
    pub fn restore_project(&mut self, loaded: LoadedProject) -> Result<&Dataset> {
        let LoadedProject { project, warnings } = loaded;

        let normalized = match project.data.dataset() {
            Ok(normalized) => normalized,
            Err(err) => return self.fail(err),
        };

        let fit_props = &project.fit_props;
        let model = if fit_props.expr.trim().is_empty() {
            None
        } else {
            match Model::with_neutral_term(&fit_props.expr, &fit_props.var) {
                Ok(model) => Some(model),
                Err(err) => return self.fail(err),
            }
        };

        let order = model
            .as_ref()
            .map(|model| model.parameter_names().to_vec())
            .unwrap_or_default();
        self.options = project.fit_options(&order);
        self.model = model;
        self.push_warnings(warnings);

        let origin = if project.id.is_empty() {
            "project".to_string()
        } else {
            project.id.clone()
        };
        Ok(self.commit_dataset(normalized, origin))
    }

    fn fitted(&self) -> Option<(&Dataset, &Model, &FitReport)> {
        Some((self.dataset.as_ref()?, self.model.as_ref()?, self.report.as_ref()?))
    }

    fn commit_dataset(&mut self, normalized: Normalized, origin: String) -> &Dataset {
        let Normalized { dataset, warnings } = normalized;
        self.push_warnings(warnings);
        self.events.push_back(Event::DataLoaded {
            origin,
            rows: dataset.len(),
            has_sx: dataset.has_sx(),
            has_sy: dataset.has_sy(),
        });

        self.generation += 1;
        self.report = None;
        self.dataset.insert(dataset)
    }

    fn push_warnings(&mut self, warnings: Vec<Warning>) {
        self.events
            .extend(warnings.into_iter().map(Event::Warning));
    }

    fn fail<T>(&mut self, err: impl Into<Error>) -> Result<T> {
        let err = err.into();
        warn!(kind = ?err.kind(), error = %err, "operation failed");
        self.events.push_back(Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;

    use crate::FitStrategy;

    fn csv_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn scenario_a() -> (Session, tempfile::NamedTempFile) {
        let file = csv_file("1,2.1,0.1,0\n2,3.9,0.1,0\n3,6.2,0.1,0\n");
        let mut session = Session::new();
        session.load_path(file.path()).unwrap();
        session.set_expression("a*x+b", "x").unwrap();
        (session, file)
    }

    #[test]
    fn weighted_fit_of_three_points() {
        let (mut session, _file) = scenario_a();
        let report = session.fit().unwrap();

        assert_eq!(report.strategy(), FitStrategy::WeightedLeastSquares);
        assert_abs_diff_eq!(report.parameters()[0].value, 2.05, epsilon = 1e-6);
        assert_eq!(report.dof(), 1);
        assert!(report.render().contains("Chi²"));

        let events = session.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::DataLoaded {
                rows: 3,
                has_sx: false,
                has_sy: true,
                ..
            }
        )));
        assert!(events.contains(&Event::Warning(Warning::ZeroUncertaintyColumn { column: "sx" })));
        assert!(events.iter().any(|e| matches!(e, Event::ParametersUpdated(p) if p.len() == 2)));
        assert!(events.iter().any(|e| matches!(e, Event::ReportReady(text) if text.contains("Chi²"))));
    }

    #[test]
    fn single_column_synthesizes_x() {
        let mut session = Session::new();
        let dataset = session.load_text("5\n3\n8\n1\n").unwrap();
        assert_eq!(dataset.x(), &[0.0, 1.0, 2.0, 3.0]);
        assert!(!dataset.has_sx());
        assert!(!dataset.has_sy());

        session.set_expression("a*x + b", "x").unwrap();
        let report = session.fit().unwrap();
        assert_eq!(report.strategy(), FitStrategy::UnweightedLeastSquares);
    }

    #[test]
    fn rejected_file_keeps_previous_dataset() {
        let (mut session, _file) = scenario_a();
        let before = session.dataset().cloned();
        let generation = session.generation();
        session.drain_events();

        let wide = csv_file("1,2,3,4,5\n");
        let err = session.load_path(wide.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
        assert!(err.to_string().contains("at most 4"));
        assert_eq!(session.dataset().cloned(), before);
        assert_eq!(session.generation(), generation);

        let events = session.drain_events();
        assert!(matches!(
            events.as_slice(),
            [Event::Error {
                kind: ErrorKind::Data,
                ..
            }]
        ));
    }

    #[test]
    fn malformed_expression_keeps_previous_model() {
        let mut session = Session::new();
        session.set_expression("a*x", "x").unwrap();

        let err = session.set_expression("a+*b", "x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expression);
        assert_eq!(session.model().map(Model::text), Some("a*x"));
    }

    #[test]
    fn fit_without_inputs_fails_cleanly() {
        let mut session = Session::new();
        let err = session.fit().unwrap_err();
        assert!(matches!(err, Error::Fit(FitError::NoData)));

        session.load_text("1 2\n2 4\n3 6\n").unwrap();
        let err = session.fit().unwrap_err();
        assert!(matches!(err, Error::Fit(FitError::NoModel)));
        assert!(session.report().is_none());
    }

    #[test]
    fn failed_fit_keeps_previous_report() {
        let (mut session, _file) = scenario_a();
        session.fit().unwrap();
        let slope = session.report().unwrap().values()[0];

        session.set_options(FitOptions {
            xmin: Some(100.0),
            ..FitOptions::default()
        });
        assert!(session.fit().is_err());
        assert_eq!(session.report().unwrap().values()[0], slope);
    }

    #[test]
    fn append_updates_generation_and_flags() {
        let mut session = Session::new();
        session.load_text("1 2\n2 4\n").unwrap();
        let generation = session.generation();

        let dataset = session.append_text("3 6 0.5\n").unwrap();
        assert_eq!(dataset.len(), 3);
        assert!(dataset.has_sy());
        assert_eq!(session.generation(), generation + 1);

        session.drain_events();
        session.append_text("9\n").unwrap();
        assert_eq!(session.generation(), generation + 1);
        assert_eq!(
            session.drain_events(),
            vec![Event::Warning(Warning::AppendNeedsColumns)]
        );
    }

    #[test]
    fn residuals_and_curve_follow_the_fit() {
        let mut session = Session::new();
        session.load_text("0 1\n1 3\n2 5\n3 7\n").unwrap();
        session.set_expression("a*x + b", "x").unwrap();
        assert!(session.residuals().is_none());

        session.fit().unwrap();
        for r in session.residuals().unwrap() {
            assert_abs_diff_eq!(r, 0.0, epsilon = 1e-6);
        }

        let curve = session.prediction_curve().unwrap();
        assert_eq!(curve.len(), 40);
        assert_abs_diff_eq!(curve[0].0, 0.0);
        assert_abs_diff_eq!(curve[39].0, 3.0);
        assert_abs_diff_eq!(curve[39].1, 7.0, epsilon = 1e-6);
    }

    #[test]
    fn evaluation_uses_the_initial_guess_and_keeps_the_report() {
        let mut session = Session::new();
        session.load_text("0 1\n1 3\n2 5\n3 7\n").unwrap();
        session.set_expression("a*x + b", "x").unwrap();
        session.set_options(FitOptions {
            initial_guess: "1/1".to_string(),
            ..FitOptions::default()
        });
        session.drain_events();

        let evaluation = session.evaluate_initial().unwrap();
        assert_eq!(evaluation.residuals, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(evaluation.curve.len(), 40);
        assert!(session.report().is_none());
        assert!(matches!(
            session.drain_events().as_slice(),
            [Event::EvaluationReady(text)] if text.contains("initial guess")
        ));

        session.fit().unwrap();
        session.evaluate_initial().unwrap();
        assert_abs_diff_eq!(session.report().unwrap().values()[0], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn evaluation_without_model_fails() {
        let mut session = Session::new();
        session.load_text("0 1\n1 3\n").unwrap();
        let err = session.evaluate_initial().unwrap_err();
        assert!(matches!(err, Error::Fit(FitError::NoModel)));
    }

    #[test]
    fn project_round_trip_reproduces_the_fit() {
        let (mut session, _file) = scenario_a();
        session.fit().unwrap();
        let values = session.report().unwrap().values();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.json");
        session.save_project(&path, "scenario").unwrap();

        let mut restored = Session::new();
        restored.load_project(&path).unwrap();
        assert_eq!(restored.dataset(), session.dataset());
        assert_eq!(restored.model().map(Model::text), Some("a*x+b"));

        let report = restored.fit().unwrap();
        for (a, b) in report.values().iter().zip(&values) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn reset_clears_everything() {
        let (mut session, _file) = scenario_a();
        session.fit().unwrap();
        session.reset();

        assert!(session.dataset().is_none());
        assert!(session.model().is_none());
        assert!(session.report().is_none());
        assert_eq!(session.options(), &FitOptions::default());
    }
}
