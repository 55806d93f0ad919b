use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::path::Path;

use super::types::*;

/// Largest integer an f64 represents exactly (2^53)
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Read the first sheet of a workbook as row records.
///
/// The first row of the used range is the header row; every later row
/// becomes one record keyed by those headers, in column order. Rows with no
/// values at all are skipped.
pub fn read_rows(path: &Path) -> Result<Vec<RowRecord>, ConversionError> {
    if !path.exists() {
        return Err(ConversionError::FileNotFound(path.to_path_buf()));
    }

    let mut workbook: Sheets<_> = open_workbook_auto(path).map_err(|source| ConversionError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| ConversionError::NoSheets(path.to_path_buf()))?;

    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|source| ConversionError::Sheet { sheet, source })?;

    range_to_records(&range)
}

/// Convert a sheet range into row records
pub fn range_to_records(range: &Range<Data>) -> Result<Vec<RowRecord>, ConversionError> {
    let mut rows = range.rows();

    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers = build_headers(header_row);

    let mut records = Vec::new();
    // Row numbers are 1-based relative to the used range; the header is row 1
    for (row_offset, row) in rows.enumerate() {
        if row.iter().all(|cell| matches!(cell, Data::Empty)) {
            continue;
        }

        let mut record = RowRecord::new();
        for (col_idx, header) in headers.iter().enumerate() {
            let value = match row.get(col_idx) {
                Some(cell) => cell_to_json(cell).map_err(|detail| ConversionError::UnsupportedCell {
                    row: row_offset + 2,
                    col: col_idx + 1,
                    detail,
                })?,
                None => Value::Null,
            };
            record.insert(header.clone(), value);
        }
        records.push(record);
    }

    Ok(records)
}

/// Header names for each column. Blank headers become `Unnamed: <index>` and
/// repeated names get a `.N` suffix so every key is unique.
fn build_headers(row: &[Data]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut headers = Vec::with_capacity(row.len());

    for (idx, cell) in row.iter().enumerate() {
        let base = match header_text(cell) {
            Some(text) if !text.trim().is_empty() => text,
            _ => format!("{}{}", UNNAMED_COLUMN_PREFIX, idx),
        };

        let mut name = base.clone();
        while let Some(count) = seen.get_mut(&name) {
            *count += 1;
            name = format!("{}.{}", base, count);
        }
        seen.insert(name.clone(), 0);
        headers.push(name);
    }

    headers
}

fn header_text(cell: &Data) -> Option<String> {
    match cell_to_json(cell).ok()? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Convert a calamine cell to its scalar JSON representation.
///
/// Error cells (`#DIV/0!`, `#N/A`, ...) are rejected.
fn cell_to_json(cell: &Data) -> Result<Value, String> {
    let value = match cell {
        Data::Empty => Value::Null,
        Data::String(s) => Value::String(s.clone()),
        Data::Float(f) => float_to_json(*f),
        Data::Int(i) => Value::Number((*i).into()),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => Value::String(format_excel_datetime(dt.as_f64())?),
        Data::DateTimeIso(s) => Value::String(s.clone()),
        Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => return Err(format!("error value {:?}", e)),
    };
    Ok(value)
}

/// Whole numbers are written as JSON integers; xlsx stores every number as a
/// float so this is the only way integer columns come out as integers.
fn float_to_json(f: f64) -> Value {
    if !f.is_finite() {
        return Value::Null;
    }
    if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        return Value::Number((f as i64).into());
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Format Excel datetime (days since 1899-12-30) to ISO 8601.
///
/// Serials outside chrono's date range are rejected rather than wrapped.
fn format_excel_datetime(value: f64) -> Result<String, String> {
    let out_of_range = || format!("date serial {} is out of range", value);
    if !value.is_finite() {
        return Err(out_of_range());
    }

    let days = value.floor();
    // Round to the nearest second; 23:59:59.6 rolls into the next day
    let seconds = ((value - days) * 86400.0).round() as i64;

    let datetime = chrono::NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .zip(chrono::TimeDelta::try_days(days as i64))
        .and_then(|(epoch, delta)| epoch.checked_add_signed(delta))
        .zip(chrono::TimeDelta::try_seconds(seconds))
        .and_then(|(date, delta)| date.checked_add_signed(delta))
        .ok_or_else(out_of_range)?;

    Ok(datetime.format("%Y-%m-%dT%H:%M:%S").to_string())
}
