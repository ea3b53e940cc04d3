use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, Trim};

use crate::error::DataError;

/// How cells are separated in a text source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Comma,
    Whitespace,
}

impl Layout {
    /// `.csv` files are comma separated; everything else is tab/space separated.
    pub(crate) fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Layout::Comma,
            _ => Layout::Whitespace,
        }
    }

    fn mismatch(self) -> DataError {
        let expected = match self {
            Layout::Comma => "csv columns must be separated by commas (',')",
            Layout::Whitespace => "txt and tsv columns must be separated by tabs or spaces",
        };
        DataError::Delimiter { expected }
    }
}

pub(crate) fn read_path(path: &Path) -> Result<Vec<Vec<String>>, DataError> {
    let bytes = fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|_| DataError::Encoding)?;
    split_records(&text, Layout::for_path(path))
}

/// Splits raw text into rows of cells. Blank lines are skipped, and a row
/// wider than the first one means the separator does not match the layout.
pub(crate) fn split_records(text: &str, layout: Layout) -> Result<Vec<Vec<String>>, DataError> {
    let text = text.trim_start_matches('\u{feff}');

    let rows = match layout {
        Layout::Comma => {
            let mut reader = ReaderBuilder::new()
                .has_headers(false)
                .flexible(true)
                .trim(Trim::All)
                .from_reader(text.as_bytes());

            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record.map_err(|_| layout.mismatch())?;
                rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
            }
            rows
        }
        Layout::Whitespace => text
            .lines()
            .map(|line| {
                line.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect(),
    };

    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .collect();

    if let Some(first) = rows.first() {
        let width = first.len();
        if rows.iter().any(|row| row.len() > width) {
            return Err(layout.mismatch());
        }
    }

    Ok(rows)
}
