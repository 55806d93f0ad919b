use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// One spreadsheet row: column header -> cell value, in column order
pub type RowRecord = Map<String, Value>;

/// Header used for columns whose header cell is blank
pub const UNNAMED_COLUMN_PREFIX: &str = "Unnamed: ";

/// Errors raised while converting a workbook to JSON
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to open workbook {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },

    #[error("Workbook {0} has no sheets")]
    NoSheets(PathBuf),

    #[error("Failed to read sheet '{sheet}': {source}")]
    Sheet {
        sheet: String,
        #[source]
        source: calamine::Error,
    },

    #[error("Unsupported cell at row {row}, column {col}: {detail}")]
    UnsupportedCell { row: usize, col: usize, detail: String },

    #[error("Source file name {0} has no usable base name")]
    InvalidName(PathBuf),

    #[error("Failed to serialize rows: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Write(#[from] StorageError),
}

/// Summary of one reconciliation pass over the upload area
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    /// Source files present in the upload area
    pub sources: usize,
    /// Base names converted during this pass
    pub converted: Vec<String>,
    /// Base names whose conversion failed
    pub failed: Vec<String>,
    /// Base names skipped because another trigger was converting them
    pub in_flight: Vec<String>,
}

impl ScanReport {
    pub fn is_idle(&self) -> bool {
        self.converted.is_empty() && self.failed.is_empty() && self.in_flight.is_empty()
    }
}
