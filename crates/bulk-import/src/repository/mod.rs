//! Repository backend abstraction.
//!
//! The importer never touches a node graph directly. Every mutation goes
//! through a [`Repository`] implementation, inside transactions the backend
//! controls. [`memory::MemoryRepository`] is a thread-safe in-memory backend.

pub mod memory;

pub use memory::{MemoryRepository, Revision, StoredContent};

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Opaque reference to a repository node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(String);

impl NodeRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a node holds content or children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    Content,
}

impl NodeKind {
    pub fn is_folder(self) -> bool {
        self == NodeKind::Folder
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Folder => f.write_str("folder"),
            NodeKind::Content => f.write_str("content"),
        }
    }
}

/// Basic facts about an existing node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node: NodeRef,
    pub name: String,
    pub kind: NodeKind,
    pub node_type: String,
    pub parent: Option<NodeRef>,
}

/// Kind of revision committed for a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Major,
    Minor,
}

impl VersionKind {
    /// Parse `major` / `minor` (any case). Anything else is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "major" => Some(VersionKind::Major),
            "minor" => Some(VersionKind::Minor),
            _ => None,
        }
    }
}

/// A typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    /// Reference to another node, e.g. an association target.
    Node(NodeRef),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Every node reference held by this value, including inside lists.
    pub fn node_refs(&self) -> Vec<&NodeRef> {
        match self {
            PropertyValue::Node(node) => vec![node],
            PropertyValue::List(values) => values.iter().flat_map(|v| v.node_refs()).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::DateTime(value)
    }
}

/// Property name to value map.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Writable stream into a node's content.
///
/// Bytes become visible on the node only once [`close`](ContentSink::close)
/// succeeds.
pub trait ContentSink: Write + Send {
    /// Commit the written bytes and return how many were written.
    fn close(self: Box<Self>) -> Result<u64>;
}

/// Operations the importer needs from a repository.
///
/// Implementations must be safe to call from many worker threads at once.
pub trait Repository: Send + Sync {
    /// Look up a node.
    fn node_info(&self, node: &NodeRef) -> Result<Option<NodeInfo>>;

    fn exists(&self, node: &NodeRef) -> Result<bool> {
        Ok(self.node_info(node)?.is_some())
    }

    /// Whether the caller may create children under `node`.
    fn can_add_children(&self, node: &NodeRef) -> Result<bool>;

    /// Human-readable path of a node, for logging and status.
    fn path_of(&self, node: &NodeRef) -> Result<String>;

    /// Find a child of `parent` by name.
    fn find_child(&self, parent: &NodeRef, name: &str) -> Result<Option<NodeRef>>;

    /// Create a node under `parent`.
    ///
    /// Fails with [`ImportError::NodeAlreadyExists`](crate::ImportError::NodeAlreadyExists)
    /// when a child with that name already exists.
    fn create_node(
        &self,
        parent: &NodeRef,
        name: &str,
        kind: NodeKind,
        node_type: &str,
    ) -> Result<NodeRef>;

    fn set_type(&self, node: &NodeRef, node_type: &str) -> Result<()>;

    fn add_aspect(&self, node: &NodeRef, aspect: &str) -> Result<()>;

    /// Merge `properties` into the node's properties.
    ///
    /// Fails with [`ImportError::InvalidReference`](crate::ImportError::InvalidReference)
    /// if the node, or any node a value refers to, doesn't exist.
    fn set_properties(&self, node: &NodeRef, properties: &Properties) -> Result<()>;

    /// Open a stream that replaces the node's content.
    fn open_content_sink(&self, node: &NodeRef) -> Result<Box<dyn ContentSink>>;

    /// Point the node's content at a file already inside the content store.
    fn link_existing_content(&self, node: &NodeRef, location: &Path) -> Result<()>;

    /// Root of the backend's managed content storage, if it has one on the
    /// local filesystem.
    fn content_store_root(&self) -> Option<PathBuf>;

    /// Snapshot the node's current state as a new revision.
    fn create_revision(
        &self,
        node: &NodeRef,
        kind: VersionKind,
        comment: Option<&str>,
    ) -> Result<()>;

    /// Run `work` inside one transaction.
    ///
    /// When `retryable` is set the backend may run `work` more than once, so
    /// `work` must reset any state it accumulates at the start of each call.
    fn run_in_transaction(&self, retryable: bool, work: &mut dyn FnMut() -> Result<()>)
        -> Result<()>;
}
