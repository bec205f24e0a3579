//! In-memory repository backend.

use super::{
    ContentSink, NodeInfo, NodeKind, NodeRef, Properties, Repository, VersionKind,
};
use crate::error::{ImportError, Result};
use crate::metadata::{ASPECT_VERSIONABLE, TYPE_FOLDER};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Content held by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    /// Bytes streamed into the repository.
    Bytes(Vec<u8>),
    /// A file already inside the content store, linked in place.
    Linked(PathBuf),
}

/// A committed revision of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Version label, e.g. `1.0` or `1.1`.
    pub label: String,
    pub kind: VersionKind,
    pub comment: Option<String>,
    pub content: Option<StoredContent>,
    pub properties: Properties,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    name: String,
    kind: NodeKind,
    node_type: String,
    parent: Option<NodeRef>,
    children: BTreeMap<String, NodeRef>,
    aspects: BTreeSet<String>,
    properties: Properties,
    content: Option<StoredContent>,
    revisions: Vec<Revision>,
    read_only: bool,
}

impl MemoryNode {
    fn new(name: &str, kind: NodeKind, node_type: &str, parent: Option<NodeRef>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            node_type: node_type.to_string(),
            parent,
            children: BTreeMap::new(),
            aspects: BTreeSet::new(),
            properties: Properties::new(),
            content: None,
            revisions: Vec::new(),
            read_only: false,
        }
    }

    fn next_label(&self, kind: VersionKind) -> String {
        let (major, minor) = self
            .revisions
            .last()
            .and_then(|r| r.label.split_once('.'))
            .and_then(|(major, minor)| Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?)))
            .unwrap_or((0, 0));
        match kind {
            VersionKind::Major => format!("{}.0", major + 1),
            VersionKind::Minor => format!("{}.{}", major, minor + 1),
        }
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    nodes: HashMap<NodeRef, MemoryNode>,
}

impl RepositoryState {
    fn node(&self, node: &NodeRef) -> Result<&MemoryNode> {
        self.nodes
            .get(node)
            .ok_or_else(|| ImportError::InvalidReference { node: node.clone() })
    }

    fn node_mut(&mut self, node: &NodeRef) -> Result<&mut MemoryNode> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| ImportError::InvalidReference { node: node.clone() })
    }
}

/// Thread-safe in-memory [`Repository`].
///
/// Transactions run their work exactly once and are not isolated: changes
/// made before a failure inside a transaction are kept.
#[derive(Debug)]
pub struct MemoryRepository {
    state: Arc<Mutex<RepositoryState>>,
    root: NodeRef,
    content_store_root: Option<PathBuf>,
    transactions: AtomicU64,
}

impl MemoryRepository {
    /// Create a repository holding only an empty root folder.
    pub fn new() -> Self {
        let root = NodeRef::new(Uuid::new_v4().to_string());
        let mut state = RepositoryState::default();
        state
            .nodes
            .insert(root.clone(), MemoryNode::new("", NodeKind::Folder, TYPE_FOLDER, None));
        Self {
            state: Arc::new(Mutex::new(state)),
            root,
            content_store_root: None,
            transactions: AtomicU64::new(0),
        }
    }

    /// Declare a local directory as the repository's content store.
    ///
    /// The root is canonicalized when it exists, so linked locations are
    /// compared against the same path the importer resolves sources to.
    pub fn with_content_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.content_store_root = Some(root.canonicalize().unwrap_or(root));
        self
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RepositoryState>> {
        lock_state(&self.state)
    }

    /// Number of transactions run so far.
    pub fn transaction_count(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }

    /// Number of nodes, including the root.
    pub fn node_count(&self) -> usize {
        self.lock().map(|s| s.nodes.len()).unwrap_or(0)
    }

    /// Resolve a `/`-separated path relative to the root.
    pub fn resolve(&self, path: &str) -> Option<NodeRef> {
        let state = self.lock().ok()?;
        let mut current = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = state.nodes.get(&current)?.children.get(segment)?.clone();
        }
        Some(current)
    }

    /// Names of a node's children, sorted.
    pub fn child_names(&self, node: &NodeRef) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|s| s.nodes.get(node).map(|n| n.children.keys().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn node_type(&self, node: &NodeRef) -> Option<String> {
        self.read(node, |n| n.node_type.clone())
    }

    pub fn aspects(&self, node: &NodeRef) -> BTreeSet<String> {
        self.read(node, |n| n.aspects.clone()).unwrap_or_default()
    }

    pub fn properties(&self, node: &NodeRef) -> Properties {
        self.read(node, |n| n.properties.clone()).unwrap_or_default()
    }

    pub fn content(&self, node: &NodeRef) -> Option<StoredContent> {
        self.read(node, |n| n.content.clone()).flatten()
    }

    pub fn revisions(&self, node: &NodeRef) -> Vec<Revision> {
        self.read(node, |n| n.revisions.clone()).unwrap_or_default()
    }

    /// Forbid or allow adding children to `node`.
    pub fn set_read_only(&self, node: &NodeRef, read_only: bool) -> Result<()> {
        self.lock()?.node_mut(node)?.read_only = read_only;
        Ok(())
    }

    fn read<T>(&self, node: &NodeRef, f: impl FnOnce(&MemoryNode) -> T) -> Option<T> {
        self.lock().ok().and_then(|s| s.nodes.get(node).map(f))
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<RepositoryState>) -> Result<MutexGuard<'_, RepositoryState>> {
    state
        .lock()
        .map_err(|e| ImportError::backend(format!("Failed to lock repository: {}", e)))
}

impl Repository for MemoryRepository {
    fn node_info(&self, node: &NodeRef) -> Result<Option<NodeInfo>> {
        let state = self.lock()?;
        Ok(state.nodes.get(node).map(|n| NodeInfo {
            node: node.clone(),
            name: n.name.clone(),
            kind: n.kind,
            node_type: n.node_type.clone(),
            parent: n.parent.clone(),
        }))
    }

    fn can_add_children(&self, node: &NodeRef) -> Result<bool> {
        Ok(!self.lock()?.node(node)?.read_only)
    }

    fn path_of(&self, node: &NodeRef) -> Result<String> {
        let state = self.lock()?;
        let mut segments = Vec::new();
        let mut current = state.node(node)?;
        while let Some(parent) = &current.parent {
            segments.push(current.name.clone());
            current = state.node(parent)?;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    fn find_child(&self, parent: &NodeRef, name: &str) -> Result<Option<NodeRef>> {
        Ok(self.lock()?.node(parent)?.children.get(name).cloned())
    }

    fn create_node(
        &self,
        parent: &NodeRef,
        name: &str,
        kind: NodeKind,
        node_type: &str,
    ) -> Result<NodeRef> {
        let mut state = self.lock()?;
        let parent_node = state.node(parent)?;
        if parent_node.kind != NodeKind::Folder {
            return Err(ImportError::backend(format!(
                "Cannot create '{}' under non-folder node {}",
                name, parent
            )));
        }
        if parent_node.children.contains_key(name) {
            return Err(ImportError::NodeAlreadyExists {
                parent: parent.clone(),
                name: name.to_string(),
            });
        }

        let node = NodeRef::new(Uuid::new_v4().to_string());
        state.nodes.insert(
            node.clone(),
            MemoryNode::new(name, kind, node_type, Some(parent.clone())),
        );
        state
            .node_mut(parent)?
            .children
            .insert(name.to_string(), node.clone());
        debug!("Created {} node '{}' ({})", kind, name, node);
        Ok(node)
    }

    fn set_type(&self, node: &NodeRef, node_type: &str) -> Result<()> {
        self.lock()?.node_mut(node)?.node_type = node_type.to_string();
        Ok(())
    }

    fn add_aspect(&self, node: &NodeRef, aspect: &str) -> Result<()> {
        self.lock()?.node_mut(node)?.aspects.insert(aspect.to_string());
        Ok(())
    }

    fn set_properties(&self, node: &NodeRef, properties: &Properties) -> Result<()> {
        let mut state = self.lock()?;
        state.node(node)?;
        if let Some(missing) = properties
            .values()
            .flat_map(|v| v.node_refs())
            .find(|r| !state.nodes.contains_key(*r))
        {
            return Err(ImportError::InvalidReference {
                node: missing.clone(),
            });
        }
        state
            .node_mut(node)?
            .properties
            .extend(properties.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn open_content_sink(&self, node: &NodeRef) -> Result<Box<dyn ContentSink>> {
        let state = self.lock()?;
        if state.node(node)?.kind != NodeKind::Content {
            return Err(ImportError::backend(format!(
                "Node {} cannot hold content",
                node
            )));
        }
        Ok(Box::new(MemoryContentSink {
            state: Arc::clone(&self.state),
            node: node.clone(),
            buffer: Vec::new(),
        }))
    }

    fn link_existing_content(&self, node: &NodeRef, location: &Path) -> Result<()> {
        if let Some(store) = &self.content_store_root {
            if !location.starts_with(store) {
                return Err(ImportError::backend(format!(
                    "'{}' is outside the content store",
                    location.display()
                )));
            }
        }
        self.lock()?.node_mut(node)?.content = Some(StoredContent::Linked(location.to_path_buf()));
        Ok(())
    }

    fn content_store_root(&self) -> Option<PathBuf> {
        self.content_store_root.clone()
    }

    fn create_revision(
        &self,
        node: &NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let target = state.node_mut(node)?;
        if !target.aspects.contains(ASPECT_VERSIONABLE) {
            return Err(ImportError::backend(format!(
                "Node {} is not versionable",
                node
            )));
        }
        let revision = Revision {
            label: target.next_label(kind),
            kind,
            comment: comment.map(str::to_string),
            content: target.content.clone(),
            properties: target.properties.clone(),
        };
        debug!("Node {} now at version {}", node, revision.label);
        target.revisions.push(revision);
        Ok(())
    }

    fn run_in_transaction(
        &self,
        _retryable: bool,
        work: &mut dyn FnMut() -> Result<()>,
    ) -> Result<()> {
        self.transactions.fetch_add(1, Ordering::Relaxed);
        work()
    }
}

struct MemoryContentSink {
    state: Arc<Mutex<RepositoryState>>,
    node: NodeRef,
    buffer: Vec<u8>,
}

impl Write for MemoryContentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContentSink for MemoryContentSink {
    fn close(self: Box<Self>) -> Result<u64> {
        let MemoryContentSink {
            state,
            node,
            buffer,
        } = *self;
        let written = buffer.len() as u64;
        lock_state(&state)?.node_mut(&node)?.content = Some(StoredContent::Bytes(buffer));
        Ok(written)
    }
}
