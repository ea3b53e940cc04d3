//! Project documents.
//!
//! A project stores the data in its display (string) form next to the fit
//! settings and plot styling. Documents written before versioning was
//! introduced are flat objects; they are migrated field by field through
//! [`LEGACY_FIELDS`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::data::{self, DisplayTable, Normalized, COLUMN_NAMES};
use crate::error::{DataError, ProjectError, Warning};
use crate::expression::DEFAULT_VARIABLE;
use crate::fit::FitOptions;

pub const PROJECT_VERSION: &str = "2.0.0";

/// Legacy field, section of the current document (empty for top level) and
/// field name inside that section.
const LEGACY_FIELDS: &[(&str, &str, &str)] = &[
    ("projectName", "", "id"),
    ("symbol_color", "dataProps", "marker_color"),
    ("symbol_size", "dataProps", "marker_size"),
    ("symbol", "dataProps", "marker"),
    ("curve_color", "dataProps", "curve_color"),
    ("curve_thickness", "dataProps", "curve_thickness"),
    ("curve_style", "dataProps", "curve_style"),
    ("xaxis", "canvasProps", "xaxis"),
    ("yaxis", "canvasProps", "yaxis"),
    ("title", "canvasProps", "title"),
    ("log_x", "canvasProps", "log_x"),
    ("log_y", "canvasProps", "log_y"),
    ("legend", "canvasProps", "legend"),
    ("grid", "canvasProps", "grid"),
    ("residuals", "canvasProps", "residuals"),
    ("xmin", "canvasProps", "xmin"),
    ("xmax", "canvasProps", "xmax"),
    ("xdiv", "canvasProps", "xdiv"),
    ("ymin", "canvasProps", "ymin"),
    ("ymax", "canvasProps", "ymax"),
    ("ydiv", "canvasProps", "ydiv"),
    ("resmin", "canvasProps", "resmin"),
    ("resmax", "canvasProps", "resmax"),
    ("expr", "fitProps", "expr"),
    ("p0", "fitProps", "p0"),
    ("wsx", "fitProps", "wsx"),
    ("wsy", "fitProps", "wsy"),
    ("parameters", "fitProps", "parameters"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub key: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default)]
    pub data_props: DataProps,
    #[serde(default)]
    pub canvas_props: CanvasProps,
    #[serde(default)]
    pub fit_props: FitProps,
    pub data: ProjectData,
}

/// Marker and curve styling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataProps {
    #[serde(deserialize_with = "lenient_string")]
    pub marker_color: String,
    #[serde(deserialize_with = "lenient_number")]
    pub marker_size: f64,
    #[serde(deserialize_with = "lenient_string")]
    pub marker: String,
    #[serde(deserialize_with = "lenient_string")]
    pub curve_color: String,
    #[serde(deserialize_with = "lenient_number")]
    pub curve_thickness: f64,
    #[serde(deserialize_with = "lenient_string")]
    pub curve_style: String,
}

impl Default for DataProps {
    fn default() -> Self {
        Self {
            marker_color: "#000".to_string(),
            marker_size: 3.0,
            marker: "o".to_string(),
            curve_color: "#000".to_string(),
            curve_thickness: 3.0,
            curve_style: "-".to_string(),
        }
    }
}

/// Axis labels and limits. Limits are kept as entered; empty means automatic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasProps {
    #[serde(deserialize_with = "lenient_string")]
    pub xaxis: String,
    #[serde(deserialize_with = "lenient_string")]
    pub yaxis: String,
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    pub log_x: bool,
    pub log_y: bool,
    pub legend: bool,
    pub grid: bool,
    pub residuals: bool,
    #[serde(deserialize_with = "lenient_string")]
    pub xmin: String,
    #[serde(deserialize_with = "lenient_string")]
    pub xmax: String,
    #[serde(deserialize_with = "lenient_string")]
    pub xdiv: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ymin: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ymax: String,
    #[serde(deserialize_with = "lenient_string")]
    pub ydiv: String,
    #[serde(deserialize_with = "lenient_string")]
    pub resmin: String,
    #[serde(deserialize_with = "lenient_string")]
    pub resmax: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitProps {
    #[serde(deserialize_with = "lenient_string")]
    pub expr: String,
    #[serde(deserialize_with = "lenient_string")]
    pub p0: String,
    pub wsx: bool,
    pub wsy: bool,
    /// Independent variable of `expr`.
    #[serde(deserialize_with = "lenient_string")]
    pub var: String,
    /// Last fitted value of each parameter.
    pub parameters: BTreeMap<String, f64>,
}

impl Default for FitProps {
    fn default() -> Self {
        Self {
            expr: String::new(),
            p0: String::new(),
            wsx: true,
            wsy: true,
            var: DEFAULT_VARIABLE.to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

/// Display-form data columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProjectData {
    #[serde(deserialize_with = "lenient_strings")]
    pub x: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub y: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_optional_strings"
    )]
    pub sy: Option<Vec<String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_optional_strings"
    )]
    pub sx: Option<Vec<String>>,
}

impl ProjectData {
    pub fn from_display(table: &DisplayTable) -> Self {
        let mut data = ProjectData::default();
        for (name, values) in table.columns() {
            match name {
                "x" => data.x = values,
                "y" => data.y = values,
                "sy" => data.sy = Some(values),
                _ => data.sx = Some(values),
            }
        }
        data
    }

    /// Runs the stored columns through the usual column-count policy.
    ///
    /// A project holding sx without sy gets a zero sy column as filler; the
    /// sentinel warning for that column is not reported.
    pub fn dataset(&self) -> Result<Normalized, DataError> {
        let mut columns: Vec<(&str, Vec<String>)> =
            vec![("x", self.x.clone()), ("y", self.y.clone())];
        let filler_sy = self.sy.is_none() && self.sx.is_some();
        match (&self.sy, &self.sx) {
            (Some(sy), Some(sx)) => {
                columns.push(("sy", sy.clone()));
                columns.push(("sx", sx.clone()));
            }
            (Some(sy), None) => columns.push(("sy", sy.clone())),
            (None, Some(sx)) => {
                columns.push(("sy", vec!["0".to_string(); sx.len()]));
                columns.push(("sx", sx.clone()));
            }
            (None, None) => {}
        }

        let mut normalized = data::from_columns(&columns)?;
        if filler_sy {
            normalized
                .warnings
                .retain(|warning| *warning != Warning::ZeroUncertaintyColumn { column: "sy" });
        }
        Ok(normalized)
    }
}

/// A parsed project with the warnings raised while reading it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedProject {
    pub project: Project,
    pub warnings: Vec<Warning>,
}

impl Project {
    pub fn new(id: impl Into<String>, data: ProjectData) -> Self {
        Self {
            key: PROJECT_VERSION.to_string(),
            id: id.into(),
            data_props: DataProps::default(),
            canvas_props: CanvasProps::default(),
            fit_props: FitProps::default(),
            data,
        }
    }

    pub fn load(path: &Path) -> Result<LoadedProject, ProjectError> {
        let text = fs::read_to_string(path).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let loaded = Self::from_json(&text)?;
        info!(path = %path.display(), id = %loaded.project.id, "loaded project");
        Ok(loaded)
    }

    /// Parses a current or legacy document.
    pub fn from_json(text: &str) -> Result<LoadedProject, ProjectError> {
        let value: Value = serde_json::from_str(text)?;
        let object = match value {
            Value::Object(object) => object,
            _ => return Err(ProjectError::MissingField("key")),
        };

        if object.contains_key("key") {
            let project: Project = serde_json::from_value(Value::Object(object))?;
            let mut warnings = Vec::new();
            if !project.key.starts_with('2') {
                warn!(key = %project.key, "project was written by an older version");
                warnings.push(Warning::LegacyProject);
            }
            Ok(LoadedProject { project, warnings })
        } else {
            warn!("migrating legacy project document");
            Ok(LoadedProject {
                project: migrate_legacy(object)?,
                warnings: vec![Warning::LegacyProject],
            })
        }
    }

    pub fn to_json(&self) -> Result<String, ProjectError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ProjectError> {
        fs::write(path, self.to_json()?).map_err(|source| ProjectError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "saved project");
        Ok(())
    }

    /// Fit settings stored with the project. Without an explicit initial
    /// guess, the stored parameter values are used in `order`.
    pub fn fit_options(&self, order: &[String]) -> FitOptions {
        let initial_guess = if self.fit_props.p0.trim().is_empty() {
            order
                .iter()
                .map(|name| match self.fit_props.parameters.get(name) {
                    Some(value) => format!("{:e}", value),
                    None => String::new(),
                })
                .collect::<Vec<_>>()
                .join(",")
        } else {
            self.fit_props.p0.clone()
        };

        FitOptions {
            initial_guess,
            wsx: self.fit_props.wsx,
            wsy: self.fit_props.wsy,
            ..FitOptions::default()
        }
    }
}

fn migrate_legacy(legacy: Map<String, Value>) -> Result<Project, ProjectError> {
    let raw_data = legacy.get("data").ok_or(ProjectError::MissingField("data"))?;
    let data = legacy_data(raw_data)?;

    let mut document = match serde_json::to_value(Project::new("", data))? {
        Value::Object(object) => object,
        _ => return Err(ProjectError::MissingField("data")),
    };

    for (from, section, to) in LEGACY_FIELDS {
        let Some(value) = legacy.get(*from) else {
            continue;
        };
        let target = if section.is_empty() {
            Some(&mut document)
        } else {
            document.get_mut(*section).and_then(Value::as_object_mut)
        };
        if let Some(target) = target {
            target.insert((*to).to_string(), value.clone());
        }
    }

    Ok(serde_json::from_value(Value::Object(document))?)
}

/// Legacy data is a JSON string (or object) of `{column: {row: value}}` or
/// `{column: [values]}`. Columns are named `x`/`y`/`sy`/`sx` or numbered.
fn legacy_data(raw: &Value) -> Result<ProjectData, ProjectError> {
    let parsed;
    let value = match raw {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)?;
            &parsed
        }
        other => other,
    };
    let columns = value.as_object().ok_or(ProjectError::MissingField("data"))?;

    let mut keyed: Vec<(usize, &Value)> = Vec::with_capacity(columns.len());
    for (name, values) in columns {
        let position = COLUMN_NAMES
            .iter()
            .position(|known| *known == name.as_str())
            .or_else(|| name.parse::<usize>().ok())
            .ok_or(ProjectError::MissingField("data"))?;
        keyed.push((position, values));
    }
    keyed.sort_by_key(|(position, _)| *position);

    let mut ordered = keyed.into_iter().map(|(_, values)| legacy_column(values));
    let mut data = ProjectData {
        x: ordered.next().ok_or(ProjectError::MissingField("x"))?,
        y: ordered.next().ok_or(ProjectError::MissingField("y"))?,
        ..ProjectData::default()
    };
    data.sy = ordered.next();
    data.sx = ordered.next();
    Ok(data)
}

fn legacy_column(values: &Value) -> Vec<String> {
    match values {
        Value::Array(items) => items.iter().map(value_text).collect(),
        Value::Object(rows) => {
            let mut indexed: Vec<(usize, String)> = rows
                .iter()
                .map(|(row, value)| (row.parse().unwrap_or(usize::MAX), value_text(value)))
                .collect();
            indexed.sort_by_key(|(row, _)| *row);
            indexed.into_iter().map(|(_, value)| value).collect()
        }
        other => vec![value_text(other)],
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(value_text(&Value::deserialize(deserializer)?))
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let number = match &value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().replace(',', ".").parse().ok(),
        _ => None,
    };
    number.ok_or_else(|| serde::de::Error::custom(format!("expected a number, found {}", value)))
}

fn lenient_strings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(legacy_column(&Value::deserialize(deserializer)?))
}

fn lenient_optional_strings<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        other => Ok(Some(legacy_column(&other))),
    }
}
