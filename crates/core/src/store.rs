//! Spreadsheet persistence.
//!
//! Each data file holds exactly one sheet. The first row is the header and every
//! following row becomes one [`Record`]. Writes always rewrite the whole file.
//!
//! ## Reading
//!
//! - A missing file reads as an empty list.
//! - Blank header cells and generated `__EMPTY…` columns are ignored.
//! - Every record carries every header column; empty cells become `""`.
//! - Numeric cells stay numbers and date cells become their serial number, so display
//!   formatting is left to [`crate::dates`].
//!
//! ## Writing
//!
//! The column set is the union of all record fields in first-appearance order. Rows
//! lacking a column are padded with `""` so that every row has the same shape.

use crate::constants::SHEET_NAME;
use crate::record::{FieldValue, Record};
use crate::{CareError, CareResult};
use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::Workbook;
use std::fs;
use std::path::Path;

/// Column name prefix produced for header cells that had no name.
const UNNAMED_COLUMN_PREFIX: &str = "__EMPTY";

/// Reads all records from the first sheet of `path`.
///
/// # Errors
///
/// Returns `CareError::SpreadsheetRead` if the file exists but cannot be opened or parsed.
pub fn read_records(path: &Path) -> CareResult<Vec<Record>> {
    if !path.exists() {
        tracing::debug!("{} does not exist, reading as empty", path.display());
        return Ok(Vec::new());
    }

    let read_err = |message: String| CareError::SpreadsheetRead {
        path: path.to_path_buf(),
        message,
    };

    let mut workbook = open_workbook_auto(path).map_err(|e| read_err(e.to_string()))?;
    let Some(first_sheet) = workbook.sheet_names().first().cloned() else {
        return Ok(Vec::new());
    };
    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| read_err(e.to_string()))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };

    // (column index, header name) for every column that is kept.
    let columns: Vec<(usize, String)> = header_row
        .iter()
        .enumerate()
        .filter_map(|(idx, cell)| {
            let name = cell_to_value(cell).to_string();
            let name = name.trim();
            if name.is_empty() || name.starts_with(UNNAMED_COLUMN_PREFIX) {
                None
            } else {
                Some((idx, name.to_owned()))
            }
        })
        .collect();

    let mut records = Vec::new();
    for row in rows {
        let mut record = Record::new();
        let mut has_content = false;
        for (idx, name) in &columns {
            let value = row.get(*idx).map(cell_to_value).unwrap_or_default();
            has_content |= !value.is_empty();
            record.set(name.clone(), value);
        }
        if has_content {
            records.push(record);
        }
    }

    tracing::debug!("read {} records from {}", records.len(), path.display());
    Ok(records)
}

fn cell_to_value(cell: &Data) -> FieldValue {
    match cell {
        Data::Empty => FieldValue::default(),
        Data::String(s) => FieldValue::Text(s.clone()),
        Data::Float(f) => FieldValue::Number(*f),
        Data::Int(i) => FieldValue::Number(*i as f64),
        Data::Bool(b) => FieldValue::Text(b.to_string()),
        Data::DateTime(dt) => FieldValue::Number(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => FieldValue::Text(s.clone()),
        Data::Error(e) => {
            tracing::debug!("spreadsheet cell error {e:?} read as empty");
            FieldValue::default()
        }
    }
}

/// The union of all field names in first-appearance order.
pub fn column_union(records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.to_owned());
            }
        }
    }
    columns
}

/// Writes `records` to `path` as a single sheet, replacing the file.
///
/// The parent directory is created if it does not exist yet.
///
/// # Errors
///
/// Returns `CareError::DirCreation` if the parent directory cannot be created, or
/// `CareError::SpreadsheetWrite` if the workbook cannot be built or saved.
pub fn write_records(path: &Path, records: &[Record]) -> CareResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CareError::DirCreation {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let columns = column_union(records);

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (col, name) in columns.iter().enumerate() {
        sheet.write_string(0, col as u16, name.as_str())?;
    }

    for (idx, record) in records.iter().enumerate() {
        let row = idx as u32 + 1;
        for (col, name) in columns.iter().enumerate() {
            let col = col as u16;
            match record.get(name) {
                Some(FieldValue::Number(n)) => {
                    sheet.write_number(row, col, *n)?;
                }
                Some(FieldValue::Text(s)) if !s.is_empty() => {
                    sheet.write_string(row, col, s.as_str())?;
                }
                // Padding: the cell stays empty and reads back as "".
                _ => {}
            }
        }
    }

    workbook.save(path)?;
    tracing::info!("wrote {} records to {}", records.len(), path.display());
    Ok(())
}
