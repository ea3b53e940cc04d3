use tracing::{debug, warn};

use crate::error::{DataError, Warning};

use super::{Dataset, DisplayTable, Normalized};

pub const MAX_COLUMNS: usize = 4;

/// Applies the column-count policy to raw string rows.
///
/// Cells are made locale tolerant (`,` becomes `.`), blank cells become `"0"`,
/// and any row holding a cell that does not parse to a finite number is
/// dropped. The surviving width decides which columns exist:
///
/// | width | columns          |
/// |-------|------------------|
/// | 1     | y (x = row index)|
/// | 2     | x, y             |
/// | 3     | x, y, sy         |
/// | 4     | x, y, sy, sx     |
///
/// An uncertainty column whose values are all exactly zero is treated as not
/// measured.
pub(crate) fn normalize(rows: Vec<Vec<String>>) -> Result<Normalized, DataError> {
    let rows: Vec<Vec<String>> = rows
        .into_iter()
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .collect();

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width > MAX_COLUMNS {
        return Err(DataError::TooManyColumns { found: width });
    }

    let mut warnings = Vec::new();
    let mut cells: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    let mut values: Vec<Vec<f64>> = Vec::with_capacity(rows.len());
    let mut dropped = 0usize;

    for row in rows {
        let mut text_row = Vec::with_capacity(width);
        let mut numeric_row = Vec::with_capacity(width);
        for idx in 0..width {
            let cell = canonical_cell(row.get(idx).map(String::as_str).unwrap_or(""));
            if let Some(value) = parse_cell(&cell) {
                numeric_row.push(value);
            }
            text_row.push(cell);
        }

        if numeric_row.len() == width {
            cells.push(text_row);
            values.push(numeric_row);
        } else {
            dropped += 1;
        }
    }

    if dropped > 0 {
        warn!(dropped, "removed rows with non-numeric values");
        warnings.push(Warning::NonNumericRowsRemoved);
    }

    if values.is_empty() {
        return Err(DataError::Empty);
    }

    let n = values.len();
    let column = |j: usize| values.iter().map(|row| row[j]).collect::<Vec<f64>>();

    let (x, y, display) = if width == 1 {
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let display_rows = cells
            .iter()
            .enumerate()
            .map(|(i, row)| vec![i.to_string(), row[0].clone()])
            .collect();
        (x, column(0), DisplayTable::new(display_rows))
    } else {
        (column(0), column(1), DisplayTable::new(cells))
    };

    let (sy, has_sy) = if width >= 3 {
        let sy = column(2);
        let present = uncertainty_present(&sy, "sy", &mut warnings);
        (sy, present)
    } else {
        (vec![0.0; n], false)
    };

    let (sx, has_sx) = if width == 4 {
        let sx = column(3);
        let present = uncertainty_present(&sx, "sx", &mut warnings);
        (sx, present)
    } else {
        (vec![0.0; n], false)
    };

    debug!(rows = n, width, has_sx, has_sy, "normalized dataset");

    Ok(Normalized {
        dataset: Dataset {
            x,
            y,
            sy,
            sx,
            has_sx,
            has_sy,
            display,
        },
        warnings,
    })
}

fn canonical_cell(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.replace(',', ".")
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    cell.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// All-zero means "not measured". Zeros mixed with real values are kept but
/// flagged, since they cannot be told apart from a forgotten entry.
fn uncertainty_present(values: &[f64], column: &'static str, warnings: &mut Vec<Warning>) -> bool {
    let zeros = values.iter().filter(|value| **value == 0.0).count();

    if zeros == values.len() {
        if values.len() > 1 {
            warn!(column, "uncertainty column is all zero; ignoring it");
            warnings.push(Warning::ZeroUncertaintyColumn { column });
        }
        false
    } else {
        if zeros > 0 {
            warn!(column, zeros, "uncertainty column mixes zero and nonzero values");
            warnings.push(Warning::AmbiguousZeroUncertainty { column });
        }
        true
    }
}
