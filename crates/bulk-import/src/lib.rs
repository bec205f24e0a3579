//! Bulk Import - Filesystem-to-repository bulk import engine.
//!
//! This crate walks a source directory tree and turns it into nodes of a
//! versioned content repository. Each directory is analysed into importable
//! items (a head revision plus any `.vN` / `.vN.M` version files and
//! `.metadata.<ext>` sidecar files), filtered, packed into weight-bounded
//! batches, and committed one batch per transaction.
//!
//! Two orchestrators drive the walk:
//! - [`SyncImporter`] imports depth-first on a single thread
//! - [`ConcurrentImporter`] fans directories out over a worker pool and ends
//!   the import once the pool is quiescent
//!
//! Both report progress through a shared [`ImportStatus`].
//!
//! # Example
//!
//! ```rust,ignore
//! use bulk_import::{DirectoryImporter, MapBasedMetadataLoader, MemoryRepository, SyncImporter};
//! use std::sync::Arc;
//!
//! fn main() -> bulk_import::Result<()> {
//!     let repo = Arc::new(MemoryRepository::new());
//!     let importer = SyncImporter::new(
//!         DirectoryImporter::new(repo.clone())
//!             .with_metadata_loader(MapBasedMetadataLoader::json()),
//!     );
//!
//!     importer.bulk_import(&repo.root(), "/data/to/import".as_ref(), false)?;
//!     println!("{:?}", importer.status().snapshot());
//!     Ok(())
//! }
//! ```

pub mod analyser;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod error;
pub mod filter;
pub mod importer;
pub mod item;
pub mod metadata;
pub mod naming;
pub mod repository;
pub mod status;

// Re-export commonly used types
pub use analyser::{AnalysedDirectory, DirectoryAnalyser};
pub use batch::{batch_items, filter_items};
pub use cancel::CancellationToken;
pub use config::{ImportConfig, ImporterConfig};
pub use error::{ImportError, Result};
pub use filter::{FileNamePatternFilter, ImportFilter, NonExistentContentFilter};
pub use importer::{ConcurrentImporter, DirectoryImporter, ImportRun, SyncImporter, WorkerPool};
pub use item::{ContentAndMetadata, FileKind, ImportableItem, VersionEntry, VersionId};
pub use metadata::{MapBasedMetadataLoader, Metadata, MetadataLoader};
pub use repository::{
    ContentSink, MemoryRepository, NodeInfo, NodeKind, NodeRef, PropertyValue, Properties,
    Repository, Revision, StoredContent, VersionKind,
};
pub use status::{
    CounterSnapshot, ImportStatus, ImportType, NodeState, ProcessingState, StatusSnapshot,
};
