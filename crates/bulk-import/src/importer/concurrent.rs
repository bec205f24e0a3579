//! Multi-threaded import: one unit of work per directory on a worker pool.
//!
//! Each unit imports its directory and then schedules a new unit for every
//! subdirectory it found, so the number of units is only known once the walk
//! is over. A monitor thread samples the pool and ends the import once no
//! unit is running or queued.

use super::{DirectoryImporter, ImportRun, WorkerPool};
use crate::config::ImportConfig;
use crate::repository::NodeRef;
use crate::status::{ImportStatus, ProcessingState};
use crate::{ImportError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// State kept for the import currently owned by the importer.
struct ActiveImport {
    pool: Arc<WorkerPool>,
    run: ImportRun,
    monitor: Option<JoinHandle<()>>,
}

/// Imports a directory tree using a pool of worker threads.
pub struct ConcurrentImporter {
    importer: Arc<DirectoryImporter>,
    active: Mutex<Option<ActiveImport>>,
}

impl ConcurrentImporter {
    pub fn new(importer: DirectoryImporter) -> Self {
        Self {
            importer: Arc::new(importer),
            active: Mutex::new(None),
        }
    }

    pub fn status(&self) -> &Arc<ImportStatus> {
        self.importer.status()
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveImport>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start importing `source` into `target` and return immediately.
    ///
    /// Validation errors, and [`ImportError::AlreadyRunning`] while another
    /// import is in progress, are returned without touching the running
    /// import. Use [`join`](Self::join) to wait for completion.
    pub fn bulk_import(&self, target: &NodeRef, source: &Path, replace_existing: bool) -> Result<()> {
        let mut active = self.active();
        let run = self.importer.begin(target, source, replace_existing)?;
        let status = Arc::clone(self.importer.status());

        let threads = self.importer.config().worker_threads();
        let pool = match WorkerPool::new(threads, ImportConfig::WORKER_THREAD_NAME_PREFIX) {
            Ok(pool) => Arc::new(pool),
            Err(err) => {
                status.import_failed(&err);
                return Err(err);
            }
        };
        info!(
            "Importing '{}' with {} worker threads",
            run.source_root.display(),
            threads
        );

        if let Err(err) = schedule(
            &pool,
            &self.importer,
            &run,
            target.clone(),
            run.source_root.clone(),
        ) {
            status.import_failed(&err);
            pool.shutdown_now();
            return Err(err);
        }

        let interval = self.importer.config().completion_check_interval;
        let monitor = {
            let pool = Arc::clone(&pool);
            let status = Arc::clone(&status);
            thread::Builder::new()
                .name(ImportConfig::MONITOR_THREAD_NAME.to_string())
                .spawn(move || monitor_completion(&pool, &status, interval))
        };
        let monitor = match monitor {
            Ok(handle) => handle,
            Err(err) => {
                let err = ImportError::from(err);
                status.import_failed(&err);
                run.token.cancel();
                pool.shutdown_now();
                return Err(err);
            }
        };

        *active = Some(ActiveImport {
            pool,
            run,
            monitor: Some(monitor),
        });
        Ok(())
    }

    /// Request a stop: `RUNNING -> STOPPING`, then discard queued units and
    /// interrupt running ones. Doesn't wait; the monitor moves the status to
    /// `STOPPED` once the pool drains.
    pub fn stop_import(&self) -> Result<()> {
        self.importer.status().stopping()?;
        if let Some(active) = self.active().as_ref() {
            active.run.token.cancel();
            let discarded = active.pool.shutdown_now();
            debug!("Stop requested, {} queued directories discarded", discarded);
        }
        Ok(())
    }

    /// Wait for the current import, if any, to reach a terminal state.
    pub fn join(&self) -> ProcessingState {
        let monitor = self.active().as_mut().and_then(|a| a.monitor.take());
        if let Some(handle) = monitor {
            if handle.join().is_err() {
                error!("Completion monitor panicked");
            }
        }
        self.importer.status().state()
    }
}

impl std::fmt::Debug for ConcurrentImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentImporter")
            .field("importer", &self.importer)
            .finish_non_exhaustive()
    }
}

fn schedule(
    pool: &Arc<WorkerPool>,
    importer: &Arc<DirectoryImporter>,
    run: &ImportRun,
    target: NodeRef,
    source: PathBuf,
) -> Result<()> {
    let unit_pool = Arc::clone(pool);
    let importer = Arc::clone(importer);
    let run = run.clone();
    pool.submit(move || run_unit(&unit_pool, &importer, &run, &target, &source))
}

/// One unit of work: import a directory and schedule its subdirectories.
///
/// Any error, including a panic, fails the whole import and discards the
/// queued units.
fn run_unit(
    pool: &Arc<WorkerPool>,
    importer: &Arc<DirectoryImporter>,
    run: &ImportRun,
    target: &NodeRef,
    source: &Path,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let subdirectories = importer.import_directory(run, target, source)?;
        for (node, directory) in subdirectories {
            run.token.check()?;
            schedule(pool, importer, run, node, directory)?;
        }
        Ok(())
    }))
    .unwrap_or_else(|payload| Err(ImportError::from_panic(payload)));

    if let Err(err) = outcome {
        let status = importer.status();
        if err.is_interruption() && status.is_stopping() {
            debug!("Import of {} interrupted by stop", source.display());
            return;
        }
        if status.import_failed(&err) {
            error!("Bulk import failed in {}: {}", source.display(), err);
        } else {
            debug!(
                "Ignoring error in {} after the import ended: {}",
                source.display(),
                err
            );
        }
        run.token.cancel();
        pool.shutdown_now();
    }
}

/// Poll until the pool is quiescent, then apply the terminal transition and
/// tear the pool down.
fn monitor_completion(pool: &WorkerPool, status: &ImportStatus, interval: Duration) {
    loop {
        thread::sleep(interval);
        if pool.is_quiescent() {
            break;
        }
    }
    let state = status.import_finished();
    pool.shutdown();
    pool.join();
    debug!("Worker pool drained, import ended as {}", state);
}
