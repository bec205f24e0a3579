//! Single-threaded, depth-first import.

use super::{DirectoryImporter, ImportRun};
use crate::cancel::CancellationToken;
use crate::config::ImportConfig;
use crate::repository::NodeRef;
use crate::status::ImportStatus;
use crate::{ImportError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Imports a directory tree on one thread.
///
/// Stopping is cooperative: the walk checks for a stop before every
/// subdirectory and every batch. Committed batches stay committed.
pub struct SyncImporter {
    importer: Arc<DirectoryImporter>,
    token: Mutex<Option<CancellationToken>>,
}

impl SyncImporter {
    pub fn new(importer: DirectoryImporter) -> Self {
        Self {
            importer: Arc::new(importer),
            token: Mutex::new(None),
        }
    }

    pub fn status(&self) -> &Arc<ImportStatus> {
        self.importer.status()
    }

    /// Import on the calling thread.
    ///
    /// A stopped import returns `Ok`; any other failure is recorded on the
    /// status and returned.
    pub fn bulk_import(&self, target: &NodeRef, source: &Path, replace_existing: bool) -> Result<()> {
        let run = self.begin(target, source, replace_existing)?;
        walk(&self.importer, &run)
    }

    /// Validate and start the import on the calling thread, then walk the
    /// tree on a background thread.
    pub fn spawn_import(
        &self,
        target: &NodeRef,
        source: &Path,
        replace_existing: bool,
    ) -> Result<JoinHandle<Result<()>>> {
        let run = self.begin(target, source, replace_existing)?;
        let importer = Arc::clone(&self.importer);
        thread::Builder::new()
            .name(ImportConfig::BACKGROUND_THREAD_NAME.to_string())
            .spawn(move || walk(&importer, &run))
            .map_err(|e| {
                let err = ImportError::from(e);
                self.importer.status().import_failed(&err);
                err
            })
    }

    /// Request a stop: `RUNNING -> STOPPING`. Doesn't wait for the walk.
    pub fn stop_import(&self) -> Result<()> {
        self.importer.status().stopping()?;
        if let Some(token) = self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
        Ok(())
    }

    /// Start the import while holding the token slot, so a stop that sees
    /// `RUNNING` always cancels this run's token.
    fn begin(&self, target: &NodeRef, source: &Path, replace_existing: bool) -> Result<ImportRun> {
        let mut current = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        let run = self.importer.begin(target, source, replace_existing)?;
        *current = Some(run.token.clone());
        Ok(run)
    }
}

impl std::fmt::Debug for SyncImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncImporter")
            .field("importer", &self.importer)
            .finish_non_exhaustive()
    }
}

/// Walk the whole tree and apply the terminal transition exactly once.
///
/// A panic in the walk fails the import like any other error.
fn walk(importer: &DirectoryImporter, run: &ImportRun) -> Result<()> {
    let status = importer.status();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| import_tree(importer, run)))
        .unwrap_or_else(|payload| Err(ImportError::from_panic(payload)));
    match outcome {
        Ok(()) => {
            status.import_finished();
            Ok(())
        }
        Err(err) if err.is_interruption() && status.is_stopping() => {
            debug!("Import interrupted by stop");
            status.import_stopped();
            Ok(())
        }
        Err(err) => {
            error!("Bulk import failed: {}", err);
            status.import_failed(&err);
            Err(err)
        }
    }
}

/// Depth-first, children in listing order.
fn import_tree(importer: &DirectoryImporter, run: &ImportRun) -> Result<()> {
    let mut pending: Vec<(NodeRef, PathBuf)> = vec![(run.target.clone(), run.source_root.clone())];
    while let Some((target, source)) = pending.pop() {
        run.token.check()?;
        let subdirectories = importer.import_directory(run, &target, &source)?;
        pending.extend(subdirectories.into_iter().rev());
    }
    Ok(())
}
