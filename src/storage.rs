//! Storage areas for uploaded workbooks and their JSON conversions.
//!
//! Both areas are plain directories. "Latest" is never stored anywhere: it is
//! recomputed from filesystem timestamps on every call, so concurrent uploads,
//! conversions and prunes only ever see a best-effort answer.

use glob::MatchOptions;
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to list {path}: {message}")]
    List { path: PathBuf, message: String },
    #[error("Failed to read metadata for {path}: {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The two directories the service works against
#[derive(Debug, Clone)]
pub struct StorageAreas {
    pub upload_dir: PathBuf,
    pub json_dir: PathBuf,
}

impl StorageAreas {
    pub fn new(config: &Config) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            json_dir: config.json_dir.clone(),
        }
    }

    /// Create both directories if they are missing
    pub fn ensure(&self) -> Result<(), StorageError> {
        for dir in [&self.upload_dir, &self.json_dir] {
            std::fs::create_dir_all(dir).map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Outcome of pruning a single area
#[derive(Debug, Clone, PartialEq)]
pub struct PruneReport {
    pub retained: PathBuf,
    pub deleted: Vec<PathBuf>,
}

/// List visible regular files in `dir`, optionally restricted to names ending
/// in `extension`. Hidden files (in-flight temporaries) are skipped.
pub fn list_files(dir: &Path, extension: Option<&str>) -> Result<Vec<PathBuf>, StorageError> {
    let pattern = format!(
        "{}/*{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        extension.map(glob::Pattern::escape).unwrap_or_default()
    );

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let entries = glob::glob_with(&pattern, options).map_err(|e| StorageError::List {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StorageError::List {
            path: dir.to_path_buf(),
            message: e.to_string(),
        })?;
        if path.is_file() {
            files.push(path);
        }
    }

    Ok(files)
}

/// Base names (file name without `extension`) of the matching files in `dir`
pub fn base_names(dir: &Path, extension: &str) -> Result<HashSet<String>, StorageError> {
    Ok(list_files(dir, Some(extension))?
        .iter()
        .filter_map(|path| base_name(path, extension))
        .collect())
}

/// File name of `path` with a trailing `extension` removed
pub fn base_name(path: &Path, extension: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(extension)?;
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Creation time of a file. Filesystems without birth times fall back to the
/// modification time.
pub fn created_at(path: &Path) -> Result<SystemTime, StorageError> {
    let metadata = std::fs::metadata(path).map_err(|source| StorageError::Metadata {
        path: path.to_path_buf(),
        source,
    })?;

    metadata
        .created()
        .or_else(|_| metadata.modified())
        .map_err(|source| StorageError::Metadata {
            path: path.to_path_buf(),
            source,
        })
}

/// The file with the greatest creation time. Ties go to the greater name.
pub fn latest_file(files: &[PathBuf]) -> Result<Option<PathBuf>, StorageError> {
    let mut latest: Option<(SystemTime, &PathBuf)> = None;

    for path in files {
        let created = created_at(path)?;
        let is_newer = match latest {
            None => true,
            Some((best, best_path)) => (created, path) > (best, best_path),
        };
        if is_newer {
            latest = Some((created, path));
        }
    }

    Ok(latest.map(|(_, path)| path.clone()))
}

/// Delete every visible file in `dir` except the latest one.
///
/// Returns `None` when the directory holds no files. Not transactional: an
/// error part way through leaves the files deleted so far gone.
pub fn retain_latest(dir: &Path) -> Result<Option<PruneReport>, StorageError> {
    let files = list_files(dir, None)?;

    let Some(retained) = latest_file(&files)? else {
        tracing::warn!(dir = %dir.display(), "No files found");
        return Ok(None);
    };
    tracing::info!(file = %retained.display(), "Retaining latest file");

    let mut deleted = Vec::new();
    for file in files.into_iter().filter(|f| *f != retained) {
        std::fs::remove_file(&file).map_err(|source| StorageError::Delete {
            path: file.clone(),
            source,
        })?;
        tracing::info!(file = %file.display(), "Deleted file");
        deleted.push(file);
    }

    Ok(Some(PruneReport { retained, deleted }))
}

/// Write `bytes` to `dir/name` through a hidden temporary file and a rename,
/// so readers never observe a half-written file.
pub fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
    let target = dir.join(name);
    let temp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&temp, &target)
    })();

    if let Err(source) = result {
        let _ = std::fs::remove_file(&temp);
        return Err(StorageError::Write {
            path: target,
            source,
        });
    }

    Ok(target)
}

fn unsafe_chars() -> &'static Regex {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("valid filename pattern"))
}

/// Reduce a client supplied file name to a safe single path component.
///
/// Directory components are dropped, whitespace runs become `_`, anything
/// outside `[A-Za-z0-9_.-]` is removed and leading/trailing `.`/`_` stripped.
/// Returns `None` if nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let joined = last.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = unsafe_chars().replace_all(&joined, "");
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        // Keep creation timestamps strictly ordered between files
        sleep(Duration::from_millis(30));
        path
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.xlsx").as_deref(), Some("report.xlsx"));
        assert_eq!(sanitize_filename("../../etc/passwd.xlsx").as_deref(), Some("passwd.xlsx"));
        assert_eq!(sanitize_filename("C:\\Users\\me\\q1 sales.xlsx").as_deref(), Some("q1_sales.xlsx"));
        assert_eq!(sanitize_filename("my  report (final).xlsx").as_deref(), Some("my_report_final.xlsx"));
        assert_eq!(sanitize_filename(".hidden.xlsx").as_deref(), Some("hidden.xlsx"));
        assert_eq!(sanitize_filename("../.."), None);
        assert_eq!(sanitize_filename(""), None);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name(Path::new("a/b/sales.xlsx"), ".xlsx").as_deref(), Some("sales"));
        assert_eq!(base_name(Path::new("sales.v2.json"), ".json").as_deref(), Some("sales.v2"));
        assert_eq!(base_name(Path::new("sales.csv"), ".xlsx"), None);
        assert_eq!(base_name(Path::new(".xlsx"), ".xlsx"), None);
    }

    #[test]
    fn test_ensure_creates_directories() {
        let root = tempfile::tempdir().unwrap();
        let areas = StorageAreas {
            upload_dir: root.path().join("nested/upload"),
            json_dir: root.path().join("json"),
        };
        areas.ensure().unwrap();
        assert!(areas.upload_dir.is_dir());
        assert!(areas.json_dir.is_dir());

        // Second call is a no-op
        areas.ensure().unwrap();
    }

    #[test]
    fn test_list_files_skips_hidden_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.json", "[]");
        touch(dir.path(), "b.txt", "");
        touch(dir.path(), ".a.json.123.tmp", "");
        touch(dir.path(), ".hidden.json", "");
        std::fs::create_dir(dir.path().join("sub.json")).unwrap();

        let mut all: Vec<_> = list_files(dir.path(), None)
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        all.sort();
        assert_eq!(all, vec!["a.json", "b.txt"]);

        let json = list_files(dir.path(), Some(".json")).unwrap();
        assert_eq!(json.len(), 1);
    }

    #[test]
    fn test_latest_file_uses_creation_time_not_name() {
        let dir = tempfile::tempdir().unwrap();
        let b = touch(dir.path(), "b.json", "1");
        let a = touch(dir.path(), "a.json", "2");

        let files = vec![b.clone(), a.clone()];
        assert_eq!(latest_file(&files).unwrap(), Some(a));
        assert_eq!(latest_file(&[]).unwrap(), None);
    }

    #[test]
    fn test_retain_latest() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "one.xlsx", "1");
        touch(dir.path(), "two.xlsx", "2");
        let newest = touch(dir.path(), "three.xlsx", "3");

        let report = retain_latest(dir.path()).unwrap().unwrap();
        assert_eq!(report.retained, newest);
        assert_eq!(report.deleted.len(), 2);

        let remaining = list_files(dir.path(), None).unwrap();
        assert_eq!(remaining, vec![newest.clone()]);
        assert_eq!(std::fs::read_to_string(&newest).unwrap(), "3");
    }

    #[test]
    fn test_retain_latest_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(retain_latest(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_write_atomic_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(dir.path(), "data.json", b"old").unwrap();
        let path = write_atomic(dir.path(), "data.json", b"new").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        // No temporaries left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
