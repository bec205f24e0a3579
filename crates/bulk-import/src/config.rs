//! Centralized configuration for the bulk importer.
//!
//! Constants live on unit structs; per-importer tunables live on
//! [`ImporterConfig`], which can be deserialized from whatever configuration
//! source the embedding process uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Importer-wide constants.
pub struct ImportConfig;

impl ImportConfig {
    /// Default batch weight (content files + metadata files per transaction).
    pub const DEFAULT_BATCH_WEIGHT: usize = 100;
    /// Default interval between quiescence checks of the concurrent importer.
    pub const DEFAULT_COMPLETION_CHECK_INTERVAL: Duration = Duration::from_millis(250);
    /// Infix that marks a metadata file: `<base>.metadata.<ext>`.
    pub const METADATA_SUFFIX: &'static str = ".metadata.";
    /// Name prefix for worker pool threads.
    pub const WORKER_THREAD_NAME_PREFIX: &'static str = "bulk-import-worker-";
    /// Name of the completion monitor thread.
    pub const MONITOR_THREAD_NAME: &'static str = "bulk-import-monitor";
    /// Name of the background thread used by the synchronous importer.
    pub const BACKGROUND_THREAD_NAME: &'static str = "bulk-import-background";
}

/// Tunables for one importer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ImporterConfig {
    /// Weight at which a batch is closed and committed.
    pub batch_weight: usize,
    /// Lower bound on the number of worker threads.
    pub min_worker_threads: usize,
    /// Upper bound on the number of worker threads.
    pub max_worker_threads: usize,
    /// How often the completion monitor samples the pool.
    pub completion_check_interval: Duration,
}

impl ImporterConfig {
    /// Set the batch weight.
    ///
    /// Non-positive values are ignored and the current weight is kept.
    pub fn set_batch_weight(&mut self, batch_weight: i64) {
        if batch_weight > 0 {
            self.batch_weight = batch_weight as usize;
        } else {
            tracing::warn!(
                "Ignoring non-positive batch weight {}, keeping {}",
                batch_weight,
                self.batch_weight
            );
        }
    }

    /// Builder-style variant of [`set_batch_weight`](Self::set_batch_weight).
    pub fn with_batch_weight(mut self, batch_weight: i64) -> Self {
        self.set_batch_weight(batch_weight);
        self
    }

    /// Builder-style setter for the worker thread bounds.
    pub fn with_worker_threads(mut self, min: usize, max: usize) -> Self {
        self.min_worker_threads = min.max(1);
        self.max_worker_threads = max.max(self.min_worker_threads);
        self
    }

    /// Builder-style setter for the completion check interval.
    pub fn with_completion_check_interval(mut self, interval: Duration) -> Self {
        self.completion_check_interval = interval;
        self
    }

    /// Number of worker threads to start.
    ///
    /// Import work is I/O bound, so the pool aims for two threads per core,
    /// clamped to the configured bounds.
    pub fn worker_threads(&self) -> usize {
        let min = self.min_worker_threads.max(1);
        let max = self.max_worker_threads.max(min);
        (available_cores() * 2).clamp(min, max)
    }

    /// Batch weight, falling back to the default if a deserialized config
    /// carried zero.
    pub fn effective_batch_weight(&self) -> usize {
        if self.batch_weight == 0 {
            ImportConfig::DEFAULT_BATCH_WEIGHT
        } else {
            self.batch_weight
        }
    }
}

impl Default for ImporterConfig {
    fn default() -> Self {
        let cores = available_cores();
        Self {
            batch_weight: ImportConfig::DEFAULT_BATCH_WEIGHT,
            min_worker_threads: cores,
            max_worker_threads: cores * 2,
            completion_check_interval: ImportConfig::DEFAULT_COMPLETION_CHECK_INTERVAL,
        }
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
