//! Import orchestration.
//!
//! [`DirectoryImporter`] holds everything needed to import one directory:
//! analysis, filtering, batching, and the per-item repository writes. The
//! two orchestrators drive it over a whole tree:
//! - [`SyncImporter`] walks depth-first on a single thread
//! - [`ConcurrentImporter`] fans directories out over a [`WorkerPool`]

mod concurrent;
mod pool;
mod sync;

pub use concurrent::ConcurrentImporter;
pub use pool::WorkerPool;
pub use sync::SyncImporter;

use crate::analyser::DirectoryAnalyser;
use crate::batch::{batch_items, filter_items};
use crate::cancel::CancellationToken;
use crate::config::ImporterConfig;
use crate::filter::ImportFilter;
use crate::item::{ContentAndMetadata, FileKind, ImportableItem};
use crate::metadata::{
    standard_metadata, Metadata, MetadataLoader, ASPECT_VERSIONABLE, TYPE_CONTENT, TYPE_FOLDER,
};
use crate::naming;
use crate::repository::{NodeKind, NodeRef, Repository, VersionKind};
use crate::status::{ImportStatus, ImportType, NodeState};
use crate::{ImportError, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A repository node paired with the source directory to import into it.
pub type Subdirectory = (NodeRef, PathBuf);

/// Parameters fixed for the duration of one import.
#[derive(Debug, Clone)]
pub struct ImportRun {
    /// Canonical source root.
    pub source_root: PathBuf,
    pub target: NodeRef,
    pub replace_existing: bool,
    pub import_type: ImportType,
    /// Interruption signal checked between directories and batches.
    pub token: CancellationToken,
}

/// Outcome of resolving an item against the repository.
#[derive(Debug)]
struct ResolvedNode {
    node: Option<NodeRef>,
    is_folder: bool,
    state: NodeState,
    descend: bool,
}

impl ResolvedNode {
    fn skipped(node: Option<NodeRef>, is_folder: bool) -> Self {
        Self {
            node,
            is_folder,
            state: NodeState::Skipped,
            descend: false,
        }
    }
}

/// What importing one item did. Applied to the status only once its batch
/// has committed, so a retried transaction counts each item once.
#[derive(Debug)]
struct ItemOutcome<'a> {
    item: &'a ImportableItem,
    is_folder: bool,
    state: NodeState,
    properties: u64,
    version_properties: u64,
}

impl<'a> ItemOutcome<'a> {
    fn skipped(item: &'a ImportableItem, is_folder: bool) -> Self {
        Self {
            item,
            is_folder,
            state: NodeState::Skipped,
            properties: 0,
            version_properties: 0,
        }
    }

    fn record(&self, status: &ImportStatus) {
        if self.state != NodeState::Skipped {
            status.items_read(self.item, self.is_folder);
        }
        status.nodes_written(
            self.item,
            self.is_folder,
            self.state,
            self.properties,
            self.version_properties,
        );
    }
}

/// Imports single directories into a repository.
pub struct DirectoryImporter {
    repository: Arc<dyn Repository>,
    metadata_loader: Option<Arc<dyn MetadataLoader>>,
    filters: Vec<Box<dyn ImportFilter>>,
    config: ImporterConfig,
    status: Arc<ImportStatus>,
    analyser: DirectoryAnalyser,
}

impl DirectoryImporter {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        let status = Arc::new(ImportStatus::new());
        Self {
            repository,
            metadata_loader: None,
            filters: Vec::new(),
            config: ImporterConfig::default(),
            analyser: DirectoryAnalyser::new(None, Arc::clone(&status)),
            status,
        }
    }

    /// Use `loader` for metadata files; this also decides which file names
    /// the analyser treats as metadata.
    pub fn with_metadata_loader(mut self, loader: impl MetadataLoader + 'static) -> Self {
        let extension = loader.metadata_file_extension().to_string();
        self.metadata_loader = Some(Arc::new(loader));
        self.analyser = DirectoryAnalyser::new(Some(extension), Arc::clone(&self.status));
        self
    }

    /// Add a filter. Filters run in the order they were added.
    pub fn with_filter(mut self, filter: impl ImportFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn with_config(mut self, config: ImporterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn status(&self) -> &Arc<ImportStatus> {
        &self.status
    }

    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    // Pre-flight

    /// Validate the arguments and claim the status tracker.
    ///
    /// Validation failures leave the tracker untouched.
    pub fn begin(&self, target: &NodeRef, source: &Path, replace_existing: bool) -> Result<ImportRun> {
        self.validate_target(target)?;
        let source_root = self.validate_source(source)?;
        let import_type = self.detect_import_type(&source_root);
        let target_path = self.repository.path_of(target)?;

        self.status.start_import(
            &source_root,
            &target_path,
            import_type,
            self.config.effective_batch_weight(),
        )?;

        Ok(ImportRun {
            source_root,
            target: target.clone(),
            replace_existing,
            import_type,
            token: CancellationToken::new(),
        })
    }

    /// The target must exist, accept children, and be a folder.
    pub fn validate_target(&self, target: &NodeRef) -> Result<()> {
        let info = self
            .repository
            .node_info(target)?
            .ok_or_else(|| ImportError::TargetNotFound(target.clone()))?;
        if !self.repository.can_add_children(target)? {
            return Err(ImportError::TargetNotWritable(target.clone()));
        }
        if !info.kind.is_folder() {
            return Err(ImportError::TargetNotAFolder(target.clone()));
        }
        Ok(())
    }

    /// The source must exist, be readable, and be a directory. Returns its
    /// canonical path.
    pub fn validate_source(&self, source: &Path) -> Result<PathBuf> {
        let meta =
            fs::metadata(source).map_err(|_| ImportError::SourceNotFound(source.to_path_buf()))?;
        let readable = if meta.is_dir() {
            fs::read_dir(source).is_ok()
        } else {
            File::open(source).is_ok()
        };
        if !readable {
            return Err(ImportError::SourceNotReadable(source.to_path_buf()));
        }
        if !meta.is_dir() {
            return Err(ImportError::SourceNotADirectory(source.to_path_buf()));
        }
        source
            .canonicalize()
            .map_err(|e| ImportError::io_with_path(e, source))
    }

    /// In-place when the source already lives inside the repository's
    /// content store.
    pub fn detect_import_type(&self, source_root: &Path) -> ImportType {
        let Some(store) = self.repository.content_store_root() else {
            return ImportType::Streaming;
        };
        let store = store.canonicalize().unwrap_or(store);
        if source_root.starts_with(&store) {
            ImportType::InPlace
        } else {
            ImportType::Streaming
        }
    }

    // Directory import

    /// Import the contents of one directory into `target`.
    ///
    /// Returns the subdirectories to descend into next.
    pub fn import_directory(
        &self,
        run: &ImportRun,
        target: &NodeRef,
        source: &Path,
    ) -> Result<Vec<Subdirectory>> {
        run.token.check()?;
        self.status.set_current_file(Some(source));

        let analysed = self.analyser.analyse_directory(source)?;
        let listed = analysed.original_listing.len();
        let importable = analysed.importable_items.len();
        let filtered = filter_items(analysed.importable_items, &self.filters);
        let filtered_count = filtered.len();
        let batches = batch_items(filtered, self.config.effective_batch_weight());

        debug!(
            "Directory analysis for {}: {} entries, {} importable items, {} after filtering, {} batches",
            source.display(),
            listed,
            importable,
            filtered_count,
            batches.len()
        );

        let mut subdirectories = Vec::new();
        for batch in &batches {
            run.token.check()?;
            subdirectories.extend(self.import_batch(run, target, batch)?);
        }
        Ok(subdirectories)
    }

    fn import_batch(
        &self,
        run: &ImportRun,
        target: &NodeRef,
        batch: &[ImportableItem],
    ) -> Result<Vec<Subdirectory>> {
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut subdirectories = Vec::new();
        self.repository.run_in_transaction(true, &mut || {
            outcomes.clear();
            subdirectories.clear();
            for item in batch {
                let (outcome, subdirectory) = self.import_item(run, target, item)?;
                outcomes.push(outcome);
                subdirectories.extend(subdirectory);
            }
            Ok(())
        })?;

        for outcome in &outcomes {
            outcome.record(&self.status);
        }
        self.status.increment_batches_completed();
        Ok(subdirectories)
    }

    fn import_item<'a>(
        &self,
        run: &ImportRun,
        target: &NodeRef,
        item: &'a ImportableItem,
    ) -> Result<(ItemOutcome<'a>, Option<Subdirectory>)> {
        debug!("Importing {}", item);
        let mut metadata = self.load_metadata(item.head_revision())?;
        let resolved = self.resolve_node(target, item, &metadata, run.replace_existing)?;

        let Some(node) = resolved.node else {
            return Ok((ItemOutcome::skipped(item, resolved.is_folder), None));
        };

        let outcome = if resolved.state == NodeState::Skipped {
            info!(
                "Skipping '{}' as it already exists in the repository",
                item.base_path().display()
            );
            ItemOutcome::skipped(item, resolved.is_folder)
        } else {
            let version_properties = if resolved.is_folder {
                self.import_folder(&node, item, &metadata)?;
                0
            } else {
                self.import_file(run, &node, item, &mut metadata)?
            };
            ItemOutcome {
                item,
                is_folder: resolved.is_folder,
                state: resolved.state,
                properties: metadata.properties().len() as u64,
                version_properties,
            }
        };

        let source = item.head_revision().content_file().map(Path::to_path_buf);
        let subdirectory = match source {
            Some(source) if resolved.descend => Some((node, source)),
            _ => None,
        };
        Ok((outcome, subdirectory))
    }

    /// Find or create the node for `item` under `target`.
    fn resolve_node(
        &self,
        target: &NodeRef,
        item: &ImportableItem,
        metadata: &Metadata,
        replace_existing: bool,
    ) -> Result<ResolvedNode> {
        let name = self.node_name(item, metadata)?;
        let head = item.head_revision();
        debug!("Searching for node named '{}' within {}", name, target);

        let Some(node) = self.repository.find_child(target, &name)? else {
            if !head.content_exists() {
                debug!(
                    "Not creating '{}' within {}: it has no content file",
                    name, target
                );
                return Ok(ResolvedNode::skipped(None, false));
            }

            let is_folder = head.is_directory();
            let (kind, default_type) = if is_folder {
                (NodeKind::Folder, TYPE_FOLDER)
            } else {
                (NodeKind::Content, TYPE_CONTENT)
            };
            let node_type = metadata.node_type().unwrap_or(default_type);
            debug!("Creating {} node '{}' within {}", node_type, name, target);

            return match self.repository.create_node(target, &name, kind, node_type) {
                Ok(node) => Ok(ResolvedNode {
                    node: Some(node),
                    is_folder,
                    state: NodeState::Created,
                    descend: is_folder,
                }),
                Err(err) if err.is_conflict() => {
                    warn!(
                        "Node '{}' within {} was created concurrently to the bulk import, skipping it",
                        name, target
                    );
                    Ok(ResolvedNode::skipped(None, is_folder))
                }
                Err(err) => Err(err),
            };
        };

        let info = self
            .repository
            .node_info(&node)?
            .ok_or_else(|| ImportError::InvalidReference { node: node.clone() })?;
        let node_is_folder = info.kind.is_folder();
        let is_folder = if head.content_exists() {
            head.is_directory()
        } else {
            node_is_folder
        };
        let descend = head.is_directory() && node_is_folder;

        if !replace_existing {
            debug!(
                "Found node {} for '{}', but replace existing is off, skipping it",
                node, name
            );
            return Ok(ResolvedNode {
                descend,
                ..ResolvedNode::skipped(Some(node), is_folder)
            });
        }

        if head.content_exists() && is_folder != node_is_folder {
            warn!(
                "Skipping replacement of {} '{}': the existing node is a {} node",
                if is_folder { "directory" } else { "file" },
                item.base_path().display(),
                info.kind
            );
            return Ok(ResolvedNode::skipped(Some(node), is_folder));
        }

        if let Some(node_type) = metadata.node_type() {
            debug!("Specialising type of node {} to '{}'", node, node_type);
            self.repository.set_type(&node, node_type)?;
        }
        Ok(ResolvedNode {
            node: Some(node),
            is_folder,
            state: NodeState::Replaced,
            descend,
        })
    }

    /// Name from metadata, else from the metadata file, else the base file
    /// name.
    fn node_name(&self, item: &ImportableItem, metadata: &Metadata) -> Result<String> {
        if let Some(name) = metadata.name() {
            return Ok(name.to_string());
        }
        let from_metadata_file = match (&self.metadata_loader, item.head_revision().metadata_file()) {
            (Some(loader), Some(path)) => path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| naming::strip_metadata_suffix(n, loader.metadata_file_extension())),
            _ => None,
        };
        from_metadata_file
            .or_else(|| item.file_name())
            .map(str::to_string)
            .ok_or_else(|| ImportError::UnresolvableName(item.base_path().to_path_buf()))
    }

    fn import_folder(&self, node: &NodeRef, item: &ImportableItem, metadata: &Metadata) -> Result<()> {
        if item.has_version_entries() {
            warn!(
                "Skipping {} versions of directory '{}': folders can't be versioned",
                item.version_count(),
                item.base_path().display()
            );
        }
        self.apply_metadata(node, item.head_revision(), metadata)
    }

    /// Write versions oldest first, then the head revision. Returns the
    /// number of version properties written.
    fn import_file(
        &self,
        run: &ImportRun,
        node: &NodeRef,
        item: &ImportableItem,
        metadata: &mut Metadata,
    ) -> Result<u64> {
        let mut version_properties = 0;
        if item.has_version_entries() {
            if !metadata.has_aspect(ASPECT_VERSIONABLE) {
                warn!(
                    "Metadata for '{}' lacks the {} aspect, yet it has {} versions; adding it",
                    item.base_path().display(),
                    ASPECT_VERSIONABLE,
                    item.version_count()
                );
                metadata.add_aspect(ASPECT_VERSIONABLE);
            }
            self.repository.add_aspect(node, ASPECT_VERSIONABLE)?;
            version_properties = self.import_versions(run, node, item)?;
        }

        debug!("Creating head revision of node {}", node);
        self.import_content_and_metadata(run, node, item.head_revision(), metadata)?;
        Ok(version_properties)
    }

    fn import_versions(&self, run: &ImportRun, node: &NodeRef, item: &ImportableItem) -> Result<u64> {
        let mut previous_major = None;
        let mut properties = 0;
        for entry in item.version_entries() {
            let record = entry.record();
            let metadata = self.load_metadata(record)?;
            self.import_content_and_metadata(run, node, record, &metadata)?;

            let version = entry.version();
            let kind = metadata
                .version_type()
                .unwrap_or_else(|| revision_kind(previous_major, version.major));
            debug!("Creating v{} of node {} as a {:?} revision", version, node, kind);
            self.repository
                .create_revision(node, kind, metadata.version_comment())?;

            previous_major = Some(version.major);
            properties += metadata.properties().len() as u64;
        }
        Ok(properties)
    }

    fn import_content_and_metadata(
        &self,
        run: &ImportRun,
        node: &NodeRef,
        record: &ContentAndMetadata,
        metadata: &Metadata,
    ) -> Result<()> {
        match record.content_file() {
            Some(path) if record.content_exists() && record.content_kind() == FileKind::File => {
                self.status.set_current_file(Some(path));
                self.write_content(run, node, path)?;
            }
            _ => debug!("No content for node {}, importing metadata only", node),
        }
        self.apply_metadata(node, record, metadata)
    }

    fn write_content(&self, run: &ImportRun, node: &NodeRef, path: &Path) -> Result<()> {
        match run.import_type {
            ImportType::InPlace => {
                debug!("Linking '{}' into node {} in place", path.display(), node);
                self.repository.link_existing_content(node, path)
            }
            ImportType::Streaming => {
                debug!("Streaming '{}' into node {}", path.display(), node);
                let mut file = File::open(path).map_err(|e| ImportError::io_with_path(e, path))?;
                let mut sink = self.repository.open_content_sink(node)?;
                io::copy(&mut file, &mut sink).map_err(|e| ImportError::io_with_path(e, path))?;
                sink.close()?;
                Ok(())
            }
        }
    }

    fn apply_metadata(
        &self,
        node: &NodeRef,
        record: &ContentAndMetadata,
        metadata: &Metadata,
    ) -> Result<()> {
        for aspect in metadata.aspects() {
            debug!("Attaching aspect '{}' to node {}", aspect, node);
            self.repository.add_aspect(node, aspect)?;
        }
        if metadata.properties().is_empty() {
            return Ok(());
        }
        match self.repository.set_properties(node, metadata.properties()) {
            Err(ImportError::InvalidReference { node: invalid }) if invalid != *node => {
                let path = record
                    .metadata_file()
                    .or(record.content_file())
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Err(ImportError::InvalidMetadataReference {
                    path,
                    node: invalid,
                })
            }
            other => other,
        }
    }

    fn load_metadata(&self, record: &ContentAndMetadata) -> Result<Metadata> {
        let mut metadata = standard_metadata(record);
        if let Some(loader) = &self.metadata_loader {
            loader.load_metadata(record, &mut metadata)?;
        }
        Ok(metadata)
    }
}

impl std::fmt::Debug for DirectoryImporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryImporter")
            .field("config", &self.config)
            .field("filters", &self.filters.len())
            .field("has_metadata_loader", &self.metadata_loader.is_some())
            .field("state", &self.status.state())
            .finish_non_exhaustive()
    }
}

/// Major for the first version and whenever the major number goes up since
/// the previous version, minor otherwise.
fn revision_kind(previous_major: Option<u32>, major: u32) -> VersionKind {
    match previous_major {
        Some(previous) if major <= previous => VersionKind::Minor,
        _ => VersionKind::Major,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MapBasedMetadataLoader, PROP_NAME};
    use crate::repository::{MemoryRepository, StoredContent};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<MemoryRepository>, DirectoryImporter) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let importer = DirectoryImporter::new(repo.clone())
            .with_metadata_loader(MapBasedMetadataLoader::json());
        (temp_dir, repo, importer)
    }

    #[test]
    fn test_revision_kind() {
        assert_eq!(revision_kind(None, 1), VersionKind::Major);
        assert_eq!(revision_kind(Some(1), 1), VersionKind::Minor);
        assert_eq!(revision_kind(Some(1), 2), VersionKind::Major);
        assert_eq!(revision_kind(Some(3), 2), VersionKind::Minor);
    }

    #[test]
    fn test_validate_source() {
        let (temp_dir, _repo, importer) = setup();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            importer.validate_source(&temp_dir.path().join("missing")),
            Err(ImportError::SourceNotFound(_))
        ));
        assert!(matches!(
            importer.validate_source(&file),
            Err(ImportError::SourceNotADirectory(_))
        ));
        assert!(importer.validate_source(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_validate_target() {
        let (_temp_dir, repo, importer) = setup();
        let root = repo.root();
        let file = repo
            .create_node(&root, "f", NodeKind::Content, TYPE_CONTENT)
            .unwrap();

        assert!(importer.validate_target(&root).is_ok());
        assert!(matches!(
            importer.validate_target(&NodeRef::new("nope")),
            Err(ImportError::TargetNotFound(_))
        ));
        assert!(matches!(
            importer.validate_target(&file),
            Err(ImportError::TargetNotAFolder(_))
        ));
        repo.set_read_only(&root, true).unwrap();
        assert!(matches!(
            importer.validate_target(&root),
            Err(ImportError::TargetNotWritable(_))
        ));
    }

    #[test]
    fn test_validation_failure_leaves_status_idle() {
        let (temp_dir, repo, importer) = setup();
        let err = importer
            .begin(&repo.root(), &temp_dir.path().join("missing"), false)
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(importer.status().state(), crate::ProcessingState::NotRunning);
    }

    #[test]
    fn test_import_directory_returns_subdirectories() {
        let (temp_dir, repo, importer) = setup();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"alpha").unwrap();

        let run = importer.begin(&repo.root(), temp_dir.path(), false).unwrap();
        let subdirectories = importer
            .import_directory(&run, &repo.root(), &run.source_root)
            .unwrap();

        assert_eq!(subdirectories.len(), 1);
        assert_eq!(subdirectories[0].0, repo.resolve("sub").unwrap());
        let file = repo.resolve("a.txt").unwrap();
        assert_eq!(
            repo.content(&file),
            Some(StoredContent::Bytes(b"alpha".to_vec()))
        );
        assert_eq!(
            repo.properties(&file).get(PROP_NAME).and_then(|v| v.as_text()),
            Some("a.txt")
        );
        assert_eq!(importer.status().batches_completed(), 1);
    }

    #[test]
    fn test_name_from_metadata_file_without_content() {
        let (temp_dir, repo, importer) = setup();
        fs::write(temp_dir.path().join("ghost.txt.metadata.json"), b"{}").unwrap();

        let run = importer.begin(&repo.root(), temp_dir.path(), false).unwrap();
        importer
            .import_directory(&run, &repo.root(), &run.source_root)
            .unwrap();

        // metadata-only items never create nodes
        assert!(repo.child_names(&repo.root()).is_empty());
    }

    #[test]
    fn test_cancelled_run_is_interrupted() {
        let (temp_dir, repo, importer) = setup();
        let run = importer.begin(&repo.root(), temp_dir.path(), false).unwrap();
        run.token.cancel();
        let err = importer
            .import_directory(&run, &repo.root(), &run.source_root)
            .unwrap_err();
        assert!(err.is_interruption());
    }
}
