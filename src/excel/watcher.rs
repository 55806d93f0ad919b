use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::converter::Converter;
use super::types::*;
use crate::config::{Config, DERIVED_EXTENSION};
use crate::storage::{self, StorageError};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to create watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Result of a single conversion attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ConvertOutcome {
    Converted(PathBuf),
    Failed,
    /// Another trigger is already converting this base name
    InFlight,
}

/// Diffs the upload area against the derived area and converts what is missing.
///
/// Shared by the event trigger and the periodic scan. Base names currently
/// being converted are tracked so the two triggers never convert the same
/// workbook at the same time.
pub struct Reconciler {
    converter: Converter,
    upload_dir: PathBuf,
    json_dir: PathBuf,
    source_extension: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Reconciler {
    pub fn new(config: &Config) -> Self {
        Self {
            converter: Converter::new(config),
            upload_dir: config.upload_dir.clone(),
            json_dir: config.json_dir.clone(),
            source_extension: config.source_extension.clone(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether `path` names a visible source workbook
    pub fn is_source(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| !n.starts_with('.') && n.ends_with(&self.source_extension))
            .unwrap_or(false)
            && storage::base_name(path, &self.source_extension).is_some()
    }

    /// Convert one source, logging the outcome. Never fails.
    pub fn convert_source(&self, source: &Path) -> ConvertOutcome {
        let Some(base) = storage::base_name(source, &self.source_extension) else {
            return ConvertOutcome::Failed;
        };
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &base) else {
            tracing::debug!(file = %source.display(), "Conversion already in progress");
            return ConvertOutcome::InFlight;
        };

        match self.converter.convert(source) {
            Ok(output) => ConvertOutcome::Converted(output),
            Err(e) => {
                tracing::error!(file = %source.display(), error = %e, "Error during file conversion");
                ConvertOutcome::Failed
            }
        }
    }

    /// One reconciliation pass: convert every source whose base name has no
    /// derived file yet.
    pub fn scan_once(&self) -> Result<ScanReport, StorageError> {
        let sources = storage::list_files(&self.upload_dir, Some(self.source_extension.as_str()))?;
        let derived = storage::base_names(&self.json_dir, DERIVED_EXTENSION)?;

        let mut report = ScanReport {
            sources: sources.len(),
            ..ScanReport::default()
        };

        for source in sources {
            let Some(base) = storage::base_name(&source, &self.source_extension) else {
                continue;
            };
            if derived.contains(&base) {
                continue;
            }

            tracing::info!(file = %source.display(), "Detected new file during scan");
            match self.convert_source(&source) {
                ConvertOutcome::Converted(_) => report.converted.push(base),
                ConvertOutcome::Failed => report.failed.push(base),
                ConvertOutcome::InFlight => report.in_flight.push(base),
            }
        }

        Ok(report)
    }
}

/// Marks a base name as being converted until dropped
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, key: &str) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            key: key.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

/// Background watcher keeping the derived area in step with the upload area.
///
/// Two triggers feed the same [`Reconciler`]: filesystem creation events on
/// the upload directory (optional) and a periodic reconciliation scan that
/// guarantees convergence even when events are missed.
pub struct FolderWatcher {
    reconciler: Arc<Reconciler>,
    shutdown: watch::Sender<bool>,
    event_watcher: Option<RecommendedWatcher>,
    tasks: Vec<JoinHandle<()>>,
}

impl FolderWatcher {
    /// Start both triggers. Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> Result<Self, WatchError> {
        let reconciler = Arc::new(Reconciler::new(config));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let event_watcher = if config.event_trigger {
            let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
            let mut watcher = RecommendedWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                notify::Config::default(),
            )
            .map_err(WatchError::Create)?;

            watcher
                .watch(&config.upload_dir, RecursiveMode::NonRecursive)
                .map_err(|source| WatchError::Watch {
                    path: config.upload_dir.clone(),
                    source,
                })?;

            tasks.push(tokio::spawn(process_watch_events(
                rx,
                reconciler.clone(),
                shutdown_rx.clone(),
            )));
            Some(watcher)
        } else {
            tracing::info!("Event trigger disabled, relying on periodic scan");
            None
        };

        tasks.push(tokio::spawn(reconcile_loop(
            reconciler.clone(),
            config.scan_interval(),
            shutdown_rx,
        )));

        tracing::info!(
            dir = %config.upload_dir.display(),
            interval_secs = config.scan_interval_secs,
            "File watcher started"
        );

        Ok(Self {
            reconciler,
            shutdown,
            event_watcher,
            tasks,
        })
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Release the event subscription and signal both loops to exit.
    /// Calling it more than once is harmless.
    pub fn stop(&mut self) {
        // Dropping the notify watcher closes the event channel
        self.event_watcher.take();
        self.shutdown.send_replace(true);
    }

    /// Wait for the background tasks to finish
    pub async fn join(mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Watcher task ended abnormally");
            }
        }
    }

    /// Stop and join
    pub async fn shutdown(mut self) {
        self.stop();
        self.join().await;
        tracing::info!("File watcher stopped");
    }
}

/// Periodic reconciliation scan. The first pass runs immediately.
async fn reconcile_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let scanner = reconciler.clone();
        match tokio::task::spawn_blocking(move || scanner.scan_once()).await {
            Ok(Ok(report)) => {
                if !report.is_idle() {
                    tracing::info!(
                        sources = report.sources,
                        converted = report.converted.len(),
                        failed = report.failed.len(),
                        in_flight = report.in_flight.len(),
                        "Scan finished"
                    );
                }
            }
            Ok(Err(e)) => tracing::error!(error = %e, "Error during manual scan for new files"),
            Err(e) => tracing::error!(error = %e, "Scan task panicked"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Convert sources as soon as they appear in the upload directory
async fn process_watch_events(
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    reconciler: Arc<Reconciler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let res = tokio::select! {
            res = rx.recv() => match res {
                Some(res) => res,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let event = match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Watch error");
                continue;
            }
        };

        for path in created_paths(&event) {
            if !reconciler.is_source(path) {
                continue;
            }
            tracing::info!(file = %path.display(), "New file detected");

            let converter = reconciler.clone();
            let path = path.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || converter.convert_source(&path)).await {
                tracing::error!(error = %e, "Conversion task panicked");
            }
        }
    }
}

/// Paths that came into existence with this event. Renames count, since
/// uploads land through a temporary file that is renamed into place.
fn created_paths(event: &Event) -> &[PathBuf] {
    match event.kind {
        EventKind::Create(_) => &event.paths[..],
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => &event.paths[..],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.get(1..).unwrap_or_default()
        }
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::CreateKind;

    fn config(root: &Path) -> Config {
        let config = Config {
            upload_dir: root.join("upload"),
            json_dir: root.join("json"),
            ..Config::default()
        };
        std::fs::create_dir_all(&config.upload_dir).unwrap();
        std::fs::create_dir_all(&config.json_dir).unwrap();
        config
    }

    fn write_workbook(path: &Path, value: &str) {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "value").unwrap();
        sheet.write_string(1, 0, value).unwrap();
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_is_source() {
        let root = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::new(&config(root.path()));
        assert!(reconciler.is_source(Path::new("upload/a.xlsx")));
        assert!(!reconciler.is_source(Path::new("upload/a.XLSX")));
        assert!(!reconciler.is_source(Path::new("upload/a.csv")));
        assert!(!reconciler.is_source(Path::new("upload/.a.xlsx.1234.tmp")));
        assert!(!reconciler.is_source(Path::new("upload/.hidden.xlsx")));
    }

    #[test]
    fn test_scan_converts_missing_then_goes_idle() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        write_workbook(&config.upload_dir.join("first.xlsx"), "one");
        write_workbook(&config.upload_dir.join("second.xlsx"), "two");
        std::fs::write(config.upload_dir.join("notes.txt"), "ignored").unwrap();

        let reconciler = Reconciler::new(&config);
        let mut report = reconciler.scan_once().unwrap();
        report.converted.sort();
        assert_eq!(report.sources, 2);
        assert_eq!(report.converted, vec!["first", "second"]);
        assert!(config.json_dir.join("first.json").exists());

        // Converged: nothing is converted again
        let before = std::fs::metadata(config.json_dir.join("first.json")).unwrap().modified().unwrap();
        let report = reconciler.scan_once().unwrap();
        assert!(report.is_idle());
        let after = std::fs::metadata(config.json_dir.join("first.json")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_scan_survives_malformed_source() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        std::fs::write(config.upload_dir.join("bad.xlsx"), b"garbage").unwrap();

        let reconciler = Reconciler::new(&config);
        let report = reconciler.scan_once().unwrap();
        assert_eq!(report.failed, vec!["bad"]);

        // A later tick still picks up good files
        write_workbook(&config.upload_dir.join("good.xlsx"), "ok");
        let report = reconciler.scan_once().unwrap();
        assert_eq!(report.converted, vec!["good"]);
        assert_eq!(report.failed, vec!["bad"]);
        assert!(!config.json_dir.join("bad.json").exists());
    }

    #[test]
    fn test_scan_survives_out_of_range_date() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());

        let mut workbook = rust_xlsxwriter::Workbook::new();
        let date = rust_xlsxwriter::Format::new().set_num_format("yyyy-mm-dd");
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "when").unwrap();
        sheet.write_number_with_format(1, 0, 1.0e15, &date).unwrap();
        workbook.save(config.upload_dir.join("a_bad.xlsx")).unwrap();
        write_workbook(&config.upload_dir.join("b_good.xlsx"), "ok");

        let reconciler = Reconciler::new(&config);
        let report = reconciler.scan_once().unwrap();
        assert_eq!(report.failed, vec!["a_bad"]);
        assert_eq!(report.converted, vec!["b_good"]);
        assert!(config.json_dir.join("b_good.json").exists());
        assert!(!config.json_dir.join("a_bad.json").exists());
    }

    #[test]
    fn test_in_flight_guard() {
        let set = Arc::new(Mutex::new(HashSet::new()));
        let first = InFlightGuard::acquire(&set, "report");
        assert!(first.is_some());
        assert!(InFlightGuard::acquire(&set, "report").is_none());
        drop(first);
        assert!(InFlightGuard::acquire(&set, "report").is_some());
    }

    #[test]
    fn test_convert_source_skips_in_flight() {
        let root = tempfile::tempdir().unwrap();
        let config = config(root.path());
        let source = config.upload_dir.join("busy.xlsx");
        write_workbook(&source, "x");

        let reconciler = Reconciler::new(&config);
        let _held = InFlightGuard::acquire(&reconciler.in_flight, "busy");
        assert_eq!(reconciler.convert_source(&source), ConvertOutcome::InFlight);
    }

    #[test]
    fn test_created_paths() {
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("a.xlsx"));
        assert_eq!(created_paths(&create), &[PathBuf::from("a.xlsx")]);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from(".a.xlsx.tmp"))
            .add_path(PathBuf::from("a.xlsx"));
        assert_eq!(created_paths(&rename), &[PathBuf::from("a.xlsx")]);

        let remove = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("a.xlsx"));
        assert!(created_paths(&remove).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_periodic_scan_converts_new_upload() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.scan_interval_secs = 1;
        config.event_trigger = false;

        let watcher = FolderWatcher::start(&config).unwrap();
        assert!(watcher.is_running());

        write_workbook(&config.upload_dir.join("late.xlsx"), "arrived");
        let derived = config.json_dir.join("late.json");
        for _ in 0..50 {
            if derived.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(derived.exists());

        let report = watcher.reconciler().scan_once().unwrap();
        assert_eq!(report.sources, 1);
        assert!(report.is_idle());

        watcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_trigger_converts_without_waiting_for_scan() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.scan_interval_secs = 3600;
        config.event_trigger = true;

        let watcher = FolderWatcher::start(&config).unwrap();
        // Let the startup scan pass over the empty directory first
        tokio::time::sleep(Duration::from_millis(200)).await;

        let staging = tempfile::tempdir().unwrap();
        let staged = staging.path().join("instant.xlsx");
        write_workbook(&staged, "now");
        let bytes = std::fs::read(&staged).unwrap();
        storage::write_atomic(&config.upload_dir, "instant.xlsx", &bytes).unwrap();

        let derived = config.json_dir.join("instant.json");
        for _ in 0..50 {
            if derived.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(derived.exists());

        watcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_ends_loops_promptly() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config(root.path());
        config.scan_interval_secs = 3600;

        let mut watcher = FolderWatcher::start(&config).unwrap();
        watcher.stop();
        watcher.stop();
        tokio::time::timeout(Duration::from_secs(5), watcher.join())
            .await
            .expect("watcher did not stop");
    }
}
