//! Excel module for converting uploaded workbooks and watching for new ones.
//!
//! This module provides:
//! - Reading the first sheet of a workbook as ordered row records
//! - Writing those records as indented JSON next to the other conversions
//! - A folder watcher that converts new uploads via filesystem events and a
//!   periodic reconciliation scan

pub mod types;
pub mod reader;
pub mod converter;
pub mod watcher;

// Re-export commonly used types and functions
pub use types::*;
pub use reader::{read_rows, range_to_records};
pub use converter::Converter;
pub use watcher::{ConvertOutcome, FolderWatcher, Reconciler, WatchError};
