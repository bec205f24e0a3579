//! Cooperative interruption signal shared between an importer and its workers.
//!
//! Workers poll the token between batches and before descending into child
//! directories. Cancelling never rolls back work that has already been
//! committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token for cooperative interruption of an import walk.
///
/// Clones share state: when `cancel()` is called on any clone, all clones
/// observe it.
///
/// # Example
///
/// ```
/// use bulk_import::cancel::CancellationToken;
///
/// let token = CancellationToken::new();
/// let worker_view = token.clone();
///
/// token.cancel();
/// assert!(worker_view.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Return `ImportError::Interrupted` if cancellation has been requested.
    pub fn check(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::ImportError::Interrupted)
        } else {
            Ok(())
        }
    }
}
