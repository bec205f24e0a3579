//! Import status tracker.
//!
//! One [`ImportStatus`] belongs to one importer and outlives every import it
//! runs. It is reset when an import starts and can be read at any time,
//! including mid-import, without blocking the workers that update it:
//! - the processing state is a single atomic
//! - every counter is its own atomic
//! - text fields sit behind their own short-lived locks
//!
//! No cross-field consistency is promised: a snapshot is not a consistent cut.

use crate::error::{ImportError, Result};
use crate::item::ImportableItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifecycle of an import.
///
/// ```text
/// NOT_RUNNING -> RUNNING -> SUCCEEDED
///                        -> FAILED
///                        -> STOPPING -> STOPPED
///                                    -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ProcessingState {
    NotRunning = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ProcessingState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessingState::Running,
            2 => ProcessingState::Succeeded,
            3 => ProcessingState::Failed,
            4 => ProcessingState::Stopping,
            5 => ProcessingState::Stopped,
            _ => ProcessingState::NotRunning,
        }
    }

    /// True while an import holds the tracker.
    pub fn in_progress(self) -> bool {
        matches!(self, ProcessingState::Running | ProcessingState::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingState::Succeeded | ProcessingState::Failed | ProcessingState::Stopped
        )
    }

    /// States a new import may start from.
    pub fn can_start(self) -> bool {
        self == ProcessingState::NotRunning || self.is_terminal()
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingState::NotRunning => write!(f, "NOT_RUNNING"),
            ProcessingState::Running => write!(f, "RUNNING"),
            ProcessingState::Succeeded => write!(f, "SUCCEEDED"),
            ProcessingState::Failed => write!(f, "FAILED"),
            ProcessingState::Stopping => write!(f, "STOPPING"),
            ProcessingState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// How content reaches the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportType {
    /// Bytes are copied into the repository.
    Streaming,
    /// Source files already live in the content store and are linked.
    InPlace,
}

impl fmt::Display for ImportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportType::Streaming => write!(f, "STREAMING"),
            ImportType::InPlace => write!(f, "IN_PLACE"),
        }
    }
}

/// Outcome of importing one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Skipped,
    Created,
    Replaced,
}

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        struct Counters {
            $($name: AtomicU64,)*
        }

        impl Counters {
            fn reset(&self) {
                $(self.$name.store(0, Ordering::SeqCst);)*
            }

            fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.load(Ordering::SeqCst),)*
                }
            }
        }

        /// Copy of every counter, taken one atomic load at a time.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct CounterSnapshot {
            $($(#[$doc])* pub $name: u64,)*
        }

        impl ImportStatus {
            $(
                $(#[$doc])*
                pub fn $name(&self) -> u64 {
                    self.counters.$name.load(Ordering::SeqCst)
                }
            )*
        }
    };
}

counters! {
    /// Transactional batches committed.
    batches_completed,
    /// Directories scanned, counting the source root.
    folders_scanned,
    files_scanned,
    /// Directory entries that couldn't be read and were skipped.
    unreadable_entries,
    content_files_read,
    content_bytes_read,
    metadata_files_read,
    metadata_bytes_read,
    content_version_files_read,
    content_version_bytes_read,
    metadata_version_files_read,
    metadata_version_bytes_read,
    space_nodes_created,
    space_nodes_replaced,
    space_nodes_skipped,
    space_properties_written,
    content_nodes_created,
    content_nodes_replaced,
    content_nodes_skipped,
    content_bytes_written,
    content_properties_written,
    content_versions_created,
    content_version_bytes_written,
    content_version_properties_written,
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    message: String,
    detail: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timing {
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

/// Thread-safe progress tracker and the authority on whether an import is
/// running.
#[derive(Debug)]
pub struct ImportStatus {
    state: AtomicU8,
    batch_weight: AtomicU64,
    counters: Counters,
    source_directory: RwLock<Option<PathBuf>>,
    target_space: RwLock<Option<String>>,
    import_type: RwLock<Option<ImportType>>,
    start_date: RwLock<Option<DateTime<Utc>>>,
    end_date: RwLock<Option<DateTime<Utc>>>,
    timing: RwLock<Timing>,
    current_file: RwLock<Option<PathBuf>>,
    last_error: RwLock<Option<ErrorRecord>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

impl ImportStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcessingState::NotRunning as u8),
            batch_weight: AtomicU64::new(0),
            counters: Counters::default(),
            source_directory: RwLock::new(None),
            target_space: RwLock::new(None),
            import_type: RwLock::new(None),
            start_date: RwLock::new(None),
            end_date: RwLock::new(None),
            timing: RwLock::new(Timing::default()),
            current_file: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn state(&self) -> ProcessingState {
        ProcessingState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn in_progress(&self) -> bool {
        self.state().in_progress()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == ProcessingState::Stopping
    }

    fn transition(&self, from: ProcessingState, to: ProcessingState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    // Lifecycle

    /// Claim the tracker for a new import and reset every field.
    ///
    /// Fails with [`ImportError::AlreadyRunning`] while another import is
    /// `RUNNING` or `STOPPING`; the running import is left untouched.
    pub fn start_import(
        &self,
        source: &Path,
        target: &str,
        import_type: ImportType,
        batch_weight: usize,
    ) -> Result<()> {
        loop {
            let current = self.state();
            if !current.can_start() {
                return Err(ImportError::AlreadyRunning);
            }
            if self.transition(current, ProcessingState::Running) {
                break;
            }
        }

        self.counters.reset();
        self.counters.folders_scanned.store(1, Ordering::SeqCst);
        self.batch_weight
            .store(batch_weight as u64, Ordering::SeqCst);
        write(&self.source_directory, Some(source.to_path_buf()));
        write(&self.target_space, Some(target.to_string()));
        write(&self.import_type, Some(import_type));
        write(&self.start_date, Some(Utc::now()));
        write(&self.end_date, None);
        write(
            &self.timing,
            Timing {
                started: Some(Instant::now()),
                elapsed: None,
            },
        );
        write(&self.current_file, None);
        write(&self.last_error, None);

        info!(
            "Bulk import started: '{}' -> '{}' ({}, batch weight {})",
            source.display(),
            target,
            import_type,
            batch_weight
        );
        Ok(())
    }

    /// Request a stop: `RUNNING -> STOPPING`.
    pub fn stopping(&self) -> Result<()> {
        if self.transition(ProcessingState::Running, ProcessingState::Stopping) {
            info!("Bulk import stop requested");
            Ok(())
        } else {
            Err(ImportError::NotRunning)
        }
    }

    /// `RUNNING -> SUCCEEDED`. Returns whether the transition happened.
    pub fn import_succeeded(&self) -> bool {
        self.finish(ProcessingState::Running, ProcessingState::Succeeded)
    }

    /// `STOPPING -> STOPPED`. Returns whether the transition happened.
    pub fn import_stopped(&self) -> bool {
        self.finish(ProcessingState::Stopping, ProcessingState::Stopped)
    }

    /// `RUNNING | STOPPING -> FAILED`, recording `error`.
    ///
    /// Returns false, and records nothing, if the import had already ended.
    pub fn import_failed(&self, error: &ImportError) -> bool {
        let failed = self.transition(ProcessingState::Running, ProcessingState::Failed)
            || self.transition(ProcessingState::Stopping, ProcessingState::Failed);
        if failed {
            write(
                &self.last_error,
                Some(ErrorRecord {
                    message: error.to_string(),
                    detail: error.detailed_message(),
                }),
            );
            self.record_end();
            self.log_summary();
        }
        failed
    }

    /// Apply the terminal transition for a walk that ran out of work:
    /// `RUNNING -> SUCCEEDED`, `STOPPING -> STOPPED`. A failed import stays
    /// failed.
    pub fn import_finished(&self) -> ProcessingState {
        if !self.import_succeeded() {
            self.import_stopped();
        }
        self.state()
    }

    fn finish(&self, from: ProcessingState, to: ProcessingState) -> bool {
        if self.transition(from, to) {
            self.record_end();
            self.log_summary();
            true
        } else {
            false
        }
    }

    fn record_end(&self) {
        write(&self.end_date, Some(Utc::now()));
        let mut timing = self
            .timing
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        timing.elapsed = timing.started.map(|s| s.elapsed());
        write(&self.current_file, None);
    }

    // Progress updates

    pub fn set_current_file(&self, path: Option<&Path>) {
        write(&self.current_file, path.map(Path::to_path_buf));
    }

    pub fn increment_folders_scanned(&self) {
        self.counters.folders_scanned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_files_scanned(&self) {
        self.counters.files_scanned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_unreadable_entries(&self) {
        self.counters
            .unreadable_entries
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_batches_completed(&self) {
        self.counters
            .batches_completed
            .fetch_add(1, Ordering::SeqCst);
    }

    /// Account for the files of an item that was read from the source.
    ///
    /// Directories carry no content bytes, and their versions are never read.
    pub fn items_read(&self, item: &ImportableItem, is_directory: bool) {
        let c = &self.counters;
        let head = item.head_revision();
        if head.content_exists() && !is_directory {
            c.content_files_read.fetch_add(1, Ordering::SeqCst);
            c.content_bytes_read
                .fetch_add(head.content_size().unwrap_or(0), Ordering::SeqCst);
        }
        if let Some(size) = head.metadata_size() {
            c.metadata_files_read.fetch_add(1, Ordering::SeqCst);
            c.metadata_bytes_read.fetch_add(size, Ordering::SeqCst);
        }
        if is_directory {
            return;
        }
        for entry in item.version_entries() {
            let record = entry.record();
            if let Some(size) = record.content_size() {
                c.content_version_files_read.fetch_add(1, Ordering::SeqCst);
                c.content_version_bytes_read
                    .fetch_add(size, Ordering::SeqCst);
            }
            if let Some(size) = record.metadata_size() {
                c.metadata_version_files_read.fetch_add(1, Ordering::SeqCst);
                c.metadata_version_bytes_read
                    .fetch_add(size, Ordering::SeqCst);
            }
        }
    }

    /// Account for the outcome of writing one item.
    ///
    /// Node counters only move for items with head content. Properties and
    /// versions are only counted for created or replaced nodes.
    pub fn nodes_written(
        &self,
        item: &ImportableItem,
        is_space: bool,
        state: NodeState,
        properties: u64,
        version_properties: u64,
    ) {
        let c = &self.counters;
        let head = item.head_revision();
        let written = state != NodeState::Skipped;

        if head.content_exists() {
            let counter = match (state, is_space) {
                (NodeState::Skipped, true) => &c.space_nodes_skipped,
                (NodeState::Skipped, false) => &c.content_nodes_skipped,
                (NodeState::Created, true) => &c.space_nodes_created,
                (NodeState::Created, false) => &c.content_nodes_created,
                (NodeState::Replaced, true) => &c.space_nodes_replaced,
                (NodeState::Replaced, false) => &c.content_nodes_replaced,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            if written && !is_space {
                c.content_bytes_written
                    .fetch_add(head.content_size().unwrap_or(0), Ordering::SeqCst);
            }
        }

        if written {
            let counter = if is_space {
                &c.space_properties_written
            } else {
                &c.content_properties_written
            };
            counter.fetch_add(properties, Ordering::SeqCst);
        }

        if written && !is_space && item.has_version_entries() {
            c.content_version_properties_written
                .fetch_add(version_properties, Ordering::SeqCst);
            for record in item.version_entries().map(|v| v.record()) {
                if let Some(size) = record.content_size() {
                    c.content_versions_created.fetch_add(1, Ordering::SeqCst);
                    c.content_version_bytes_written
                        .fetch_add(size, Ordering::SeqCst);
                }
            }
        }
    }

    // Read side

    pub fn batch_weight(&self) -> u64 {
        self.batch_weight.load(Ordering::SeqCst)
    }

    pub fn source_directory(&self) -> Option<PathBuf> {
        read(&self.source_directory)
    }

    pub fn target_space(&self) -> Option<String> {
        read(&self.target_space)
    }

    pub fn import_type(&self) -> Option<ImportType> {
        read(&self.import_type)
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        read(&self.start_date)
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        read(&self.end_date)
    }

    /// Time since the import started, or its total duration once it ended.
    pub fn duration(&self) -> Option<Duration> {
        let timing = read(&self.timing);
        timing
            .elapsed
            .or_else(|| timing.started.map(|s| s.elapsed()))
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        read(&self.current_file)
    }

    /// Message of the error that ended the last import, if any.
    pub fn last_error(&self) -> Option<String> {
        read(&self.last_error).map(|e| e.message)
    }

    /// The last error with its chain of causes.
    pub fn last_error_detail(&self) -> Option<String> {
        read(&self.last_error).map(|e| e.detail)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            in_progress: self.in_progress(),
            source_directory: self.source_directory(),
            target_space: self.target_space(),
            import_type: self.import_type(),
            start_date: self.start_date(),
            end_date: self.end_date(),
            duration_ms: self.duration().map(|d| d.as_millis() as u64),
            current_file_being_processed: self.current_file(),
            batch_weight: self.batch_weight(),
            last_error: self.last_error(),
            counters: self.counters(),
        }
    }

    /// Log the statistics of the current or last import.
    pub fn log_summary(&self) {
        let c = self.counters();
        let seconds = self.duration().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        info!(
            "Bulk import {} in {:.3}s\n\
             \tsource: {}\n\
             \ttarget: {}\n\
             \tbatches: {} (weight {})\n\
             \tscanned: {} folders, {} files, {} unreadable\n\
             \tread: {} content files ({} bytes), {} metadata files ({} bytes)\n\
             \tread versions: {} content ({} bytes), {} metadata ({} bytes)\n\
             \tfolders: {} created, {} replaced, {} skipped, {} properties\n\
             \tcontent: {} created, {} replaced, {} skipped, {} bytes, {} properties\n\
             \tversions: {} created, {} bytes, {} properties",
            self.state(),
            seconds,
            self.source_directory()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.target_space().unwrap_or_default(),
            c.batches_completed,
            self.batch_weight(),
            c.folders_scanned,
            c.files_scanned,
            c.unreadable_entries,
            c.content_files_read,
            c.content_bytes_read,
            c.metadata_files_read,
            c.metadata_bytes_read,
            c.content_version_files_read,
            c.content_version_bytes_read,
            c.metadata_version_files_read,
            c.metadata_version_bytes_read,
            c.space_nodes_created,
            c.space_nodes_replaced,
            c.space_nodes_skipped,
            c.space_properties_written,
            c.content_nodes_created,
            c.content_nodes_replaced,
            c.content_nodes_skipped,
            c.content_bytes_written,
            c.content_properties_written,
            c.content_versions_created,
            c.content_version_bytes_written,
            c.content_version_properties_written,
        );
        if let Some(detail) = self.last_error_detail() {
            debug!("Last error: {}", detail);
        }
    }
}

impl Default for ImportStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of an [`ImportStatus`], ready for a reporting front end.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ProcessingState,
    pub in_progress: bool,
    pub source_directory: Option<PathBuf>,
    pub target_space: Option<String>,
    pub import_type: Option<ImportType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub current_file_being_processed: Option<PathBuf>,
    pub batch_weight: u64,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn started() -> ImportStatus {
        let status = ImportStatus::new();
        status
            .start_import(Path::new("/src"), "/target", ImportType::Streaming, 100)
            .unwrap();
        status
    }

    #[test]
    fn test_start_resets_and_counts_root() {
        let status = started();
        assert_eq!(status.state(), ProcessingState::Running);
        assert_eq!(status.folders_scanned(), 1);
        assert_eq!(status.batch_weight(), 100);
        assert!(status.start_date().is_some());
        assert!(status.end_date().is_none());
    }

    #[test]
    fn test_second_start_rejected() {
        let status = started();
        status.increment_files_scanned();

        let err = status
            .start_import(Path::new("/other"), "/t", ImportType::InPlace, 5)
            .unwrap_err();
        assert!(matches!(err, ImportError::AlreadyRunning));
        assert_eq!(status.files_scanned(), 1);
        assert_eq!(status.source_directory(), Some(PathBuf::from("/src")));

        status.stopping().unwrap();
        assert!(status
            .start_import(Path::new("/other"), "/t", ImportType::InPlace, 5)
            .is_err());
    }

    #[test]
    fn test_stop_transitions() {
        let status = ImportStatus::new();
        assert!(matches!(status.stopping(), Err(ImportError::NotRunning)));

        let status = started();
        status.stopping().unwrap();
        assert_eq!(status.state(), ProcessingState::Stopping);
        assert!(!status.import_succeeded());
        assert_eq!(status.import_finished(), ProcessingState::Stopped);
        assert!(status.end_date().is_some());
    }

    #[test]
    fn test_failure_records_error_and_restart_allowed() {
        let status = started();
        assert!(status.import_failed(&ImportError::Other("disk on fire".into())));
        assert_eq!(status.state(), ProcessingState::Failed);
        assert_eq!(status.last_error().as_deref(), Some("disk on fire"));
        assert_eq!(status.import_finished(), ProcessingState::Failed);

        // a late failure after the import ended changes nothing
        assert!(!status.import_failed(&ImportError::Interrupted));
        assert_eq!(status.last_error().as_deref(), Some("disk on fire"));

        status
            .start_import(Path::new("/src"), "/t", ImportType::Streaming, 10)
            .unwrap();
        assert_eq!(status.last_error(), None);
    }

    #[test]
    fn test_duration_frozen_after_end() {
        let status = started();
        status.import_succeeded();
        let first = status.duration().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(status.duration(), Some(first));
    }

    #[test]
    fn test_nodes_written_counts() {
        let temp_dir = TempDir::new().unwrap();
        let head = temp_dir.path().join("a.txt");
        let v1 = temp_dir.path().join("a.txt.v1");
        fs::write(&head, b"12345").unwrap();
        fs::write(&v1, b"123").unwrap();

        let mut item = ImportableItem::new(&head);
        item.version_entry_mut(1.into())
            .record_mut()
            .set_content_file(&v1);

        let status = started();
        status.items_read(&item, false);
        status.nodes_written(&item, false, NodeState::Created, 4, 2);
        status.nodes_written(&item, false, NodeState::Skipped, 4, 2);

        let c = status.counters();
        assert_eq!(c.content_files_read, 1);
        assert_eq!(c.content_bytes_read, 5);
        assert_eq!(c.content_version_files_read, 1);
        assert_eq!(c.content_nodes_created, 1);
        assert_eq!(c.content_nodes_skipped, 1);
        assert_eq!(c.content_bytes_written, 5);
        assert_eq!(c.content_properties_written, 4);
        assert_eq!(c.content_versions_created, 1);
        assert_eq!(c.content_version_bytes_written, 3);
        assert_eq!(c.content_version_properties_written, 2);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let status = started();
        status.increment_unreadable_entries();
        let json = serde_json::to_value(status.snapshot()).unwrap();
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["importType"], "STREAMING");
        assert_eq!(json["unreadableEntries"], 1);
        assert_eq!(json["foldersScanned"], 1);
    }
}
