use serde::Serialize;
use std::path::{Path, PathBuf};

use super::reader::read_rows;
use super::types::*;
use crate::config::{Config, DERIVED_EXTENSION};
use crate::storage;

/// Indentation used for derived JSON files
const JSON_INDENT: &[u8] = b"    ";

/// Converts uploaded workbooks into JSON files in the derived area
#[derive(Debug, Clone)]
pub struct Converter {
    json_dir: PathBuf,
    source_extension: String,
}

impl Converter {
    pub fn new(config: &Config) -> Self {
        Self {
            json_dir: config.json_dir.clone(),
            source_extension: config.source_extension.clone(),
        }
    }

    /// Path of the JSON file `source` converts to
    pub fn derived_path(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        Ok(self.json_dir.join(self.derived_name(source)?))
    }

    fn derived_name(&self, source: &Path) -> Result<String, ConversionError> {
        let base = storage::base_name(source, &self.source_extension)
            .or_else(|| {
                source
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .filter(|s| !s.is_empty() && !s.starts_with('.'))
                    .map(str::to_string)
            })
            .ok_or_else(|| ConversionError::InvalidName(source.to_path_buf()))?;

        Ok(format!("{}{}", base, DERIVED_EXTENSION))
    }

    /// Convert one workbook and return the path of the written JSON file.
    ///
    /// Re-converting the same source overwrites the same output. Nothing is
    /// written unless the whole workbook was read and serialized.
    pub fn convert(&self, source: &Path) -> Result<PathBuf, ConversionError> {
        let name = self.derived_name(source)?;
        let rows = read_rows(source)?;
        let json = to_pretty_json(&rows)?;

        let written = storage::write_atomic(&self.json_dir, &name, &json)?;
        tracing::info!(
            source = %source.display(),
            output = %written.display(),
            rows = rows.len(),
            "Converted workbook to JSON"
        );
        Ok(written)
    }
}

fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(JSON_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(buf)
}
