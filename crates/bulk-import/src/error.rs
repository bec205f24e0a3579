//! Error types for the bulk importer.
//!
//! Errors fall into four groups: validation failures raised before an import
//! starts, transient backend conflicts that the importer recovers from locally,
//! cancellation-induced interruptions, and everything else, which is fatal to
//! the running import.

use crate::repository::NodeRef;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the bulk importer.
#[derive(Debug, Error)]
pub enum ImportError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Pre-flight validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Source '{0}' doesn't exist")]
    SourceNotFound(PathBuf),

    #[error("Source '{0}' is not readable")]
    SourceNotReadable(PathBuf),

    #[error("Source '{0}' is not a directory")]
    SourceNotADirectory(PathBuf),

    #[error("Target '{0}' doesn't exist")]
    TargetNotFound(NodeRef),

    #[error("Target '{0}' is not writeable")]
    TargetNotWritable(NodeRef),

    #[error("Target '{0}' is not a folder")]
    TargetNotAFolder(NodeRef),

    // Lifecycle errors
    #[error("An import is already in progress")]
    AlreadyRunning,

    #[error("No import is in progress")]
    NotRunning,

    // Repository errors
    #[error("A node named '{name}' already exists in '{parent}'")]
    NodeAlreadyExists { parent: NodeRef, name: String },

    #[error("Invalid node reference: {node}")]
    InvalidReference { node: NodeRef },

    #[error(
        "Invalid node reference '{node}' found in metadata for {path:?}; \
         an association probably points at a node that doesn't exist"
    )]
    InvalidMetadataReference { path: PathBuf, node: NodeRef },

    #[error("Unable to determine a node name for '{0}'")]
    UnresolvableName(PathBuf),

    #[error("Repository error: {message}")]
    Backend { message: String },

    // Metadata errors
    #[error("Metadata error in {path:?}: {message}")]
    Metadata { path: PathBuf, message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Cancellation
    #[error("Import was interrupted")]
    Interrupted,

    #[error("Import panicked: {0}")]
    Panicked(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for importer operations.
pub type Result<T> = std::result::Result<T, ImportError>;

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ImportError {
    fn from(err: serde_json::Error) -> Self {
        ImportError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ImportError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ImportError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a backend error from any displayable message.
    pub fn backend(message: impl Into<String>) -> Self {
        ImportError::Backend {
            message: message.into(),
        }
    }

    /// Convert a payload caught by `catch_unwind` into an error.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown panic payload".to_string()),
        };
        ImportError::Panicked(message)
    }

    /// True when the error was raised because the import is being torn down.
    ///
    /// Callers must still check that the import is `STOPPING`; an interruption
    /// seen in any other state is a real failure.
    pub fn is_interruption(&self) -> bool {
        match self {
            ImportError::Interrupted => true,
            ImportError::Io {
                source: Some(source),
                ..
            } => source.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }

    /// True for the "someone else created it first" race on node creation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ImportError::NodeAlreadyExists { .. })
    }

    /// True for errors raised by pre-flight validation of import arguments.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ImportError::Validation { .. }
                | ImportError::SourceNotFound(_)
                | ImportError::SourceNotReadable(_)
                | ImportError::SourceNotADirectory(_)
                | ImportError::TargetNotFound(_)
                | ImportError::TargetNotWritable(_)
                | ImportError::TargetNotAFolder(_)
        )
    }

    /// Render the error together with its chain of causes, one per line.
    pub fn detailed_message(&self) -> String {
        let mut message = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            message.push_str("\ncaused by: ");
            message.push_str(&err.to_string());
            cause = err.source();
        }
        message
    }
}
