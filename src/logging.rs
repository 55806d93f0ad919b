use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: InitError,
    },
}

/// Keeps the file writer alive; buffered lines are flushed when dropped
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber: one line per event to stdout and, when
/// configured, appended to the log file. Fails if the log file cannot be
/// opened, before anything is installed.
pub fn init(config: &Config) -> Result<LogGuard, LoggingError> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_LOG_FILTER));

    let stdout_layer = fmt::layer().with_target(false);

    let (file_layer, file_guard) = match config.log_file.as_deref() {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(file_appender(path)?);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        eprintln!("Logging already initialised: {}", e);
    }

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

fn file_appender(path: &Path) -> Result<RollingFileAppender, LoggingError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| crate::config::DEFAULT_LOG_FILE.to_string());

    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|source| LoggingError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_appender_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("logs").join("app_log.txt");
        assert!(file_appender(&path).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_file_appender_unusable_directory() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("plain.txt");
        std::fs::write(&not_a_dir, "x").unwrap();

        let err = file_appender(&not_a_dir.join("app_log.txt")).unwrap_err();
        assert!(matches!(err, LoggingError::LogFile { .. }));
        assert!(err.to_string().contains("app_log.txt"));
    }

    #[test]
    fn test_init_reports_unusable_log_file() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("plain.txt");
        std::fs::write(&not_a_dir, "x").unwrap();

        let config = Config {
            log_file: Some(not_a_dir.join("app_log.txt")),
            ..Config::default()
        };
        assert!(init(&config).is_err());
    }
}
