//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use bulk_import::{
    ContentAndMetadata, ContentSink, MemoryRepository, Metadata, MetadataLoader, NodeInfo,
    NodeKind, NodeRef, Properties, Repository, Result, VersionKind,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Write `contents` to `root/relative`, creating parent directories.
pub fn write_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

/// Every node path below `node`, depth-first, children sorted by name.
pub fn tree(repo: &MemoryRepository, node: &NodeRef) -> Vec<String> {
    fn walk(repo: &MemoryRepository, node: &NodeRef, prefix: &str, out: &mut Vec<String>) {
        for name in repo.child_names(node) {
            let path = format!("{}{}", prefix, name);
            let child = repo.resolve(&path).unwrap();
            out.push(path.clone());
            walk(repo, &child, &format!("{}/", path), out);
        }
    }
    let mut out = Vec::new();
    walk(repo, node, "", &mut out);
    out
}

/// Panics while loading the metadata file at `sub/a.txt.metadata.json`.
pub struct PanickingLoader;

impl MetadataLoader for PanickingLoader {
    fn metadata_file_extension(&self) -> &str {
        "json"
    }

    fn load_metadata(&self, record: &ContentAndMetadata, _metadata: &mut Metadata) -> Result<()> {
        if let Some(path) = record.metadata_file() {
            if path.ends_with("sub/a.txt.metadata.json") {
                panic!("loader blew up on {}", path.display());
            }
        }
        Ok(())
    }
}

/// A [`MemoryRepository`] with adjustable transaction behaviour.
pub struct WrappedRepository {
    pub inner: Arc<MemoryRepository>,
    delay: Duration,
    attempts: usize,
}

impl WrappedRepository {
    /// Every transaction takes at least `delay`.
    pub fn slow(inner: Arc<MemoryRepository>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            attempts: 1,
        }
    }

    /// Retryable transactions run their work twice, the way a backend
    /// retrying after a conflict would.
    pub fn replaying(inner: Arc<MemoryRepository>) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            attempts: 2,
        }
    }
}

impl Repository for WrappedRepository {
    fn node_info(&self, node: &NodeRef) -> Result<Option<NodeInfo>> {
        self.inner.node_info(node)
    }

    fn can_add_children(&self, node: &NodeRef) -> Result<bool> {
        self.inner.can_add_children(node)
    }

    fn path_of(&self, node: &NodeRef) -> Result<String> {
        self.inner.path_of(node)
    }

    fn find_child(&self, parent: &NodeRef, name: &str) -> Result<Option<NodeRef>> {
        self.inner.find_child(parent, name)
    }

    fn create_node(
        &self,
        parent: &NodeRef,
        name: &str,
        kind: NodeKind,
        node_type: &str,
    ) -> Result<NodeRef> {
        self.inner.create_node(parent, name, kind, node_type)
    }

    fn set_type(&self, node: &NodeRef, node_type: &str) -> Result<()> {
        self.inner.set_type(node, node_type)
    }

    fn add_aspect(&self, node: &NodeRef, aspect: &str) -> Result<()> {
        self.inner.add_aspect(node, aspect)
    }

    fn set_properties(&self, node: &NodeRef, properties: &Properties) -> Result<()> {
        self.inner.set_properties(node, properties)
    }

    fn open_content_sink(&self, node: &NodeRef) -> Result<Box<dyn ContentSink>> {
        self.inner.open_content_sink(node)
    }

    fn link_existing_content(&self, node: &NodeRef, location: &Path) -> Result<()> {
        self.inner.link_existing_content(node, location)
    }

    fn content_store_root(&self) -> Option<PathBuf> {
        self.inner.content_store_root()
    }

    fn create_revision(
        &self,
        node: &NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<()> {
        self.inner.create_revision(node, kind, comment)
    }

    fn run_in_transaction(
        &self,
        retryable: bool,
        work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        thread::sleep(self.delay);
        let attempts = if retryable { self.attempts } else { 1 };
        for _ in 1..attempts {
            self.inner.run_in_transaction(retryable, work)?;
        }
        self.inner.run_in_transaction(retryable, work)
    }
}
