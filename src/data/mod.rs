//! Dataset normalization.
//!
//! Every ingestion path (file, clipboard text, editable table, project
//! document) funnels through the same column-count policy so that the
//! resulting [`Dataset`] always has the canonical `x, y, sy, sx` shape.

mod ingest;
mod normalize;

use std::path::Path;

use tracing::info;

use crate::error::{DataError, Warning};

use ingest::Layout;

pub use normalize::MAX_COLUMNS;

/// Canonical column names, in storage order.
pub const COLUMN_NAMES: [&str; 4] = ["x", "y", "sy", "sx"];

/// Data in the string form it was entered with, after decimal-comma
/// normalization. This is what projects persist.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayTable {
    rows: Vec<Vec<String>>,
}

impl DisplayTable {
    pub(crate) fn new(rows: Vec<Vec<String>>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn width(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    /// Column-major view keyed by canonical name; only present columns.
    pub fn columns(&self) -> Vec<(&'static str, Vec<String>)> {
        (0..self.width())
            .map(|j| {
                let values = self
                    .rows
                    .iter()
                    .map(|row| row.get(j).cloned().unwrap_or_default())
                    .collect();
                (COLUMN_NAMES[j], values)
            })
            .collect()
    }
}

/// A four-column numeric table with uncertainty presence flags.
///
/// Absent uncertainty columns are filled with `0.0` so every backend sees
/// the same shape; the flags, not the values, say what was measured.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub(crate) x: Vec<f64>,
    pub(crate) y: Vec<f64>,
    pub(crate) sy: Vec<f64>,
    pub(crate) sx: Vec<f64>,
    pub(crate) has_sx: bool,
    pub(crate) has_sy: bool,
    pub(crate) display: DisplayTable,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn sy(&self) -> &[f64] {
        &self.sy
    }

    pub fn sx(&self) -> &[f64] {
        &self.sx
    }

    pub fn has_sx(&self) -> bool {
        self.has_sx
    }

    pub fn has_sy(&self) -> bool {
        self.has_sy
    }

    pub fn display(&self) -> &DisplayTable {
        &self.display
    }

    /// Smallest and largest x, or `None` when empty.
    pub fn x_bounds(&self) -> Option<(f64, f64)> {
        self.x.iter().copied().fold(None, |acc, value| match acc {
            None => Some((value, value)),
            Some((lo, hi)) => Some((lo.min(value), hi.max(value))),
        })
    }

    /// Rows with `xmin <= x <= xmax`, as a new dataset. The stored display
    /// form is kept as is since the filter is a fit-time view only.
    pub fn within(&self, xmin: Option<f64>, xmax: Option<f64>) -> Dataset {
        if xmin.is_none() && xmax.is_none() {
            return self.clone();
        }

        let keep: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let x = self.x[i];
                xmin.map_or(true, |lo| x >= lo) && xmax.map_or(true, |hi| x <= hi)
            })
            .collect();
        let pick = |values: &[f64]| keep.iter().map(|&i| values[i]).collect::<Vec<_>>();

        Dataset {
            x: pick(&self.x),
            y: pick(&self.y),
            sy: pick(&self.sy),
            sx: pick(&self.sx),
            has_sx: self.has_sx,
            has_sy: self.has_sy,
            display: self.display.clone(),
        }
    }
}

/// A freshly normalized dataset plus the warnings raised while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub dataset: Dataset,
    pub warnings: Vec<Warning>,
}

/// One row of an editable table: its cells and whether it takes part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub cells: Vec<String>,
    pub keep: bool,
}

impl TableRow {
    pub fn new<S: Into<String>>(cells: impl IntoIterator<Item = S>, keep: bool) -> Self {
        Self {
            cells: cells.into_iter().map(Into::into).collect(),
            keep,
        }
    }
}

/// Loads a data file; `.csv` is comma separated, anything else tab/space.
pub fn load_path(path: &Path) -> Result<Normalized, DataError> {
    let rows = ingest::read_path(path)?;
    let normalized = normalize::normalize(rows)?;
    info!(
        path = %path.display(),
        rows = normalized.dataset.len(),
        "loaded dataset from file"
    );
    Ok(normalized)
}

/// Loads tab/space separated text, as pasted from a spreadsheet.
pub fn from_text(text: &str) -> Result<Normalized, DataError> {
    let rows = ingest::split_records(text, Layout::Whitespace)?;
    let normalized = normalize::normalize(rows)?;
    info!(rows = normalized.dataset.len(), "loaded dataset from text");
    Ok(normalized)
}

/// Loads rows from an editable table. Rows not marked `keep` are discarded
/// before the column count is computed.
pub fn from_rows(rows: &[TableRow]) -> Result<Normalized, DataError> {
    let kept = rows
        .iter()
        .filter(|row| row.keep)
        .map(|row| row.cells.clone())
        .collect();
    let normalized = normalize::normalize(kept)?;
    info!(rows = normalized.dataset.len(), "loaded dataset from table");
    Ok(normalized)
}

/// Loads named display columns (`x`, `y`, `sy`, `sx`). Columns must be
/// supplied in canonical order and share one length.
pub fn from_columns(columns: &[(&str, Vec<String>)]) -> Result<Normalized, DataError> {
    if columns.len() > MAX_COLUMNS {
        return Err(DataError::TooManyColumns {
            found: columns.len(),
        });
    }

    let expected = columns.first().map(|(_, values)| values.len()).unwrap_or(0);
    for (name, values) in columns {
        if values.len() != expected {
            return Err(DataError::RaggedColumns {
                column: name.to_string(),
                found: values.len(),
                expected,
            });
        }
    }

    let rows = (0..expected)
        .map(|i| columns.iter().map(|(_, values)| values[i].clone()).collect())
        .collect();
    let normalized = normalize::normalize(rows)?;
    info!(rows = normalized.dataset.len(), "loaded dataset from columns");
    Ok(normalized)
}

/// Appends pasted rows to an existing dataset.
///
/// Concatenation happens on the display form, then the whole table is
/// normalized again, so the presence flags may change with the new shape.
/// A single-column block is refused with a warning and the dataset is
/// returned unchanged.
pub fn append_text(existing: &Dataset, text: &str) -> Result<Normalized, DataError> {
    let extra = ingest::split_records(text, Layout::Whitespace)?;
    let extra_width = extra.iter().map(Vec::len).max().unwrap_or(0);

    if extra_width <= 1 {
        return Ok(Normalized {
            dataset: existing.clone(),
            warnings: vec![Warning::AppendNeedsColumns],
        });
    }

    let width = existing.display.width().max(extra_width);
    let rows: Vec<Vec<String>> = existing
        .display
        .rows()
        .iter()
        .cloned()
        .chain(extra)
        .map(|mut row| {
            row.resize(width, "0".to_string());
            row
        })
        .collect();

    let normalized = normalize::normalize(rows)?;
    info!(rows = normalized.dataset.len(), "appended rows to dataset");
    Ok(normalized)
}
