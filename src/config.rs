use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_UPLOAD_DIR: &str = "upload_files";
pub const DEFAULT_JSON_DIR: &str = "json_files";
pub const DEFAULT_SOURCE_EXTENSION: &str = ".xlsx";
pub const DERIVED_EXTENSION: &str = ".json";
/// Interval between reconciliation scans, in seconds
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_LOG_FILE: &str = "app_log.txt";
pub const DEFAULT_LOG_FILTER: &str = "info";
/// Maximum accepted upload body (50MB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Service configuration, handed to each component at construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub upload_dir: PathBuf,
    pub json_dir: PathBuf,
    pub source_extension: String,
    pub scan_interval_secs: u64,
    /// Convert on filesystem creation events in addition to the periodic scan
    pub event_trigger: bool,
    pub bind_addr: String,
    pub log_file: Option<PathBuf>,
    pub log_filter: String,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_DIR),
            json_dir: PathBuf::from(DEFAULT_JSON_DIR),
            source_extension: DEFAULT_SOURCE_EXTENSION.to_string(),
            scan_interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            event_trigger: true,
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            log_file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `X2J_*` (and `RUST_LOG`) overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(std::env::vars())
    }

    pub(crate) fn apply_vars<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "X2J_UPLOAD_DIR" => self.upload_dir = PathBuf::from(value),
                "X2J_JSON_DIR" => self.json_dir = PathBuf::from(value),
                "X2J_SOURCE_EXTENSION" => self.source_extension = value,
                "X2J_SCAN_INTERVAL_SECS" => {
                    self.scan_interval_secs = value.parse().map_err(|_| {
                        ConfigError::invalid("scan_interval_secs", format!("not a number: {}", value))
                    })?;
                }
                "X2J_EVENT_TRIGGER" => {
                    self.event_trigger = parse_bool(&value).ok_or_else(|| {
                        ConfigError::invalid("event_trigger", format!("not a boolean: {}", value))
                    })?;
                }
                "X2J_BIND_ADDR" => self.bind_addr = value,
                "X2J_LOG_FILE" => {
                    self.log_file = if value.is_empty() { None } else { Some(PathBuf::from(value)) };
                }
                "X2J_MAX_UPLOAD_BYTES" => {
                    self.max_upload_bytes = value.parse().map_err(|_| {
                        ConfigError::invalid("max_upload_bytes", format!("not a number: {}", value))
                    })?;
                }
                "RUST_LOG" => self.log_filter = value,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_interval_secs == 0 {
            return Err(ConfigError::invalid("scan_interval_secs", "must be at least 1"));
        }
        if !self.source_extension.starts_with('.') || self.source_extension.len() < 2 {
            return Err(ConfigError::invalid(
                "source_extension",
                format!("expected a dotted extension like .xlsx, got '{}'", self.source_extension),
            ));
        }
        if self.source_extension == DERIVED_EXTENSION {
            return Err(ConfigError::invalid("source_extension", "must differ from .json"));
        }
        if self.upload_dir == self.json_dir {
            return Err(ConfigError::invalid("json_dir", "must differ from upload_dir"));
        }
        self.socket_addr()?;
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|e| ConfigError::invalid("bind_addr", format!("{}: {}", self.bind_addr, e)))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
