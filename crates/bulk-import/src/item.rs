//! Importable item model.
//!
//! An [`ImportableItem`] is one prospective repository node: a head revision
//! (current content and metadata) plus an ordered history of
//! [`VersionEntry`]s recovered from versioned file names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// What kind of filesystem entry a content file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// Something else (socket, device, ...).
    Other,
    /// No content file has been observed yet.
    #[default]
    Unknown,
}

/// A version identifier parsed from a file name, ordered by `(major, minor)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct VersionId {
    pub major: u32,
    pub minor: u32,
}

impl VersionId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl From<u32> for VersionId {
    fn from(major: u32) -> Self {
        Self::new(major, 0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A content file and metadata file pairing, with stat results captured when
/// each file was assigned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentAndMetadata {
    content_file: Option<PathBuf>,
    content_exists: bool,
    content_readable: bool,
    content_kind: FileKind,
    content_size: u64,
    content_created: Option<DateTime<Utc>>,
    content_modified: Option<DateTime<Utc>>,
    metadata_file: Option<PathBuf>,
    metadata_size: u64,
}

impl ContentAndMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the content file and stat it.
    ///
    /// The path is kept even if nothing exists there; existence, readability,
    /// size, timestamps and kind reflect what the stat found.
    pub fn set_content_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        match fs::metadata(&path) {
            Ok(meta) => {
                self.content_exists = true;
                self.content_size = meta.len();
                self.content_modified = meta.modified().ok().map(DateTime::<Utc>::from);
                self.content_created = meta
                    .created()
                    .ok()
                    .map(DateTime::<Utc>::from)
                    .or(self.content_modified);
                self.content_kind = if meta.is_file() {
                    FileKind::File
                } else if meta.is_dir() {
                    FileKind::Directory
                } else {
                    FileKind::Other
                };
                self.content_readable = is_readable(&path, self.content_kind);
            }
            Err(_) => {
                self.content_exists = false;
                self.content_readable = false;
                self.content_kind = FileKind::Unknown;
                self.content_size = 0;
                self.content_created = None;
                self.content_modified = None;
            }
        }
        self.content_file = Some(path);
    }

    /// Assign the metadata file. Ignored if nothing exists at `path`.
    pub fn set_metadata_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if let Ok(meta) = fs::metadata(&path) {
            self.metadata_size = meta.len();
            self.metadata_file = Some(path);
        }
    }

    pub fn content_file(&self) -> Option<&Path> {
        self.content_file.as_deref()
    }

    pub fn content_exists(&self) -> bool {
        self.content_exists
    }

    pub fn is_content_readable(&self) -> bool {
        self.content_readable
    }

    /// Kind of the content file; `Unknown` until an existing file is observed.
    pub fn content_kind(&self) -> FileKind {
        self.content_kind
    }

    pub fn content_size(&self) -> Option<u64> {
        self.content_exists.then_some(self.content_size)
    }

    pub fn content_created(&self) -> Option<DateTime<Utc>> {
        self.content_created
    }

    pub fn content_modified(&self) -> Option<DateTime<Utc>> {
        self.content_modified
    }

    pub fn is_directory(&self) -> bool {
        self.content_exists && self.content_kind == FileKind::Directory
    }

    pub fn metadata_file(&self) -> Option<&Path> {
        self.metadata_file.as_deref()
    }

    pub fn metadata_exists(&self) -> bool {
        self.metadata_file.is_some()
    }

    pub fn metadata_size(&self) -> Option<u64> {
        self.metadata_file.as_ref().map(|_| self.metadata_size)
    }

    /// One per existing content file plus one per metadata file.
    pub fn weight(&self) -> usize {
        usize::from(self.content_exists) + usize::from(self.metadata_exists())
    }
}

/// One historical revision of an item.
///
/// Equality and ordering consider only the version identifier.
#[derive(Debug, Clone)]
pub struct VersionEntry {
    version: VersionId,
    record: ContentAndMetadata,
}

impl VersionEntry {
    pub fn new(version: VersionId) -> Self {
        Self {
            version,
            record: ContentAndMetadata::new(),
        }
    }

    pub fn version(&self) -> VersionId {
        self.version
    }

    pub fn record(&self) -> &ContentAndMetadata {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut ContentAndMetadata {
        &mut self.record
    }

    pub fn weight(&self) -> usize {
        self.record.weight()
    }
}

impl PartialEq for VersionEntry {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for VersionEntry {}

impl PartialOrd for VersionEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VersionEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version.cmp(&other.version)
    }
}

/// A prospective repository node.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportableItem {
    /// Path the item is keyed on: the content file path with any version or
    /// metadata suffix removed.
    base_path: PathBuf,
    head: ContentAndMetadata,
    versions: BTreeMap<VersionId, VersionEntry>,
}

impl ImportableItem {
    /// Create an item keyed on `base_path`, with its head content file
    /// assigned (and stat'd) from that path.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        let mut head = ContentAndMetadata::new();
        head.set_content_file(&base_path);
        Self {
            base_path,
            head,
            versions: BTreeMap::new(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Final component of the base path.
    pub fn file_name(&self) -> Option<&str> {
        self.base_path.file_name().and_then(|n| n.to_str())
    }

    pub fn head_revision(&self) -> &ContentAndMetadata {
        &self.head
    }

    pub fn head_revision_mut(&mut self) -> &mut ContentAndMetadata {
        &mut self.head
    }

    pub fn has_version_entries(&self) -> bool {
        !self.versions.is_empty()
    }

    /// Version entries in ascending version order.
    pub fn version_entries(&self) -> impl Iterator<Item = &VersionEntry> + '_ {
        self.versions.values()
    }

    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    pub fn version_entry(&self, version: VersionId) -> Option<&VersionEntry> {
        self.versions.get(&version)
    }

    /// Find the entry for `version`, creating an empty one if needed.
    pub fn version_entry_mut(&mut self, version: VersionId) -> &mut VersionEntry {
        self.versions
            .entry(version)
            .or_insert_with(|| VersionEntry::new(version))
    }

    /// Add a version entry, replacing any entry with the same identifier.
    pub fn add_version_entry(&mut self, entry: VersionEntry) {
        self.versions.insert(entry.version(), entry);
    }

    /// An item is importable if it has head content, head metadata, or at
    /// least one version.
    pub fn is_valid(&self) -> bool {
        self.head.content_exists() || self.head.metadata_exists() || self.has_version_entries()
    }

    /// Batching cost: head weight plus the weight of every version entry.
    pub fn weight(&self) -> usize {
        self.head.weight() + self.versions.values().map(VersionEntry::weight).sum::<usize>()
    }

    pub fn is_directory(&self) -> bool {
        self.head.is_directory()
    }
}

impl fmt::Display for ImportableItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_path.display())?;
        if self.has_version_entries() {
            write!(f, " ({} versions)", self.versions.len())?;
        }
        Ok(())
    }
}

fn is_readable(path: &Path, kind: FileKind) -> bool {
    match kind {
        FileKind::Directory => fs::read_dir(path).is_ok(),
        FileKind::File => fs::File::open(path).is_ok(),
        FileKind::Other | FileKind::Unknown => true,
    }
}
