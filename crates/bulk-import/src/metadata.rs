//! Per-item metadata and the loaders that read it from metadata files.
//!
//! Every record with existing content first receives the standard
//! filesystem metadata (type, name, title, timestamps); the configured
//! [`MetadataLoader`] then layers whatever its metadata file declares on top.

use crate::item::ContentAndMetadata;
use crate::naming;
use crate::repository::{Properties, PropertyValue, VersionKind};
use crate::{ImportError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::warn;

/// Node type given to content nodes.
pub const TYPE_CONTENT: &str = "content";
/// Node type given to folder nodes.
pub const TYPE_FOLDER: &str = "folder";
/// Aspect a node needs before revisions can be created on it.
pub const ASPECT_VERSIONABLE: &str = "versionable";

pub const PROP_NAME: &str = "name";
pub const PROP_TITLE: &str = "title";
pub const PROP_CREATED: &str = "created";
pub const PROP_MODIFIED: &str = "modified";

/// Metadata destined for one node revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    node_type: Option<String>,
    aspects: BTreeSet<String>,
    properties: Properties,
    parent_association: Option<String>,
    version_comment: Option<String>,
    version_type: Option<VersionKind>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    pub fn set_type(&mut self, node_type: impl Into<String>) {
        self.node_type = Some(node_type.into());
    }

    pub fn aspects(&self) -> &BTreeSet<String> {
        &self.aspects
    }

    pub fn has_aspect(&self, aspect: &str) -> bool {
        self.aspects.contains(aspect)
    }

    pub fn add_aspect(&mut self, aspect: impl Into<String>) {
        self.aspects.insert(aspect.into());
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn add_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// The `name` property, if it holds text.
    pub fn name(&self) -> Option<&str> {
        self.property(PROP_NAME).and_then(PropertyValue::as_text)
    }

    pub fn parent_association(&self) -> Option<&str> {
        self.parent_association.as_deref()
    }

    pub fn set_parent_association(&mut self, association: impl Into<String>) {
        self.parent_association = Some(association.into());
    }

    pub fn version_comment(&self) -> Option<&str> {
        self.version_comment.as_deref()
    }

    pub fn set_version_comment(&mut self, comment: impl Into<String>) {
        self.version_comment = Some(comment.into());
    }

    pub fn version_type(&self) -> Option<VersionKind> {
        self.version_type
    }

    pub fn set_version_type(&mut self, kind: VersionKind) {
        self.version_type = Some(kind);
    }
}

/// Metadata derived from the content file itself.
///
/// Records without existing content get nothing.
pub fn standard_metadata(record: &ContentAndMetadata) -> Metadata {
    let mut metadata = Metadata::new();
    if !record.content_exists() {
        return metadata;
    }

    metadata.set_type(if record.is_directory() {
        TYPE_FOLDER
    } else {
        TYPE_CONTENT
    });

    if let Some(file_name) = record
        .content_file()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
    {
        let name = naming::strip_version_suffix(file_name);
        metadata.add_property(PROP_NAME, name);
        metadata.add_property(PROP_TITLE, name);
    }
    if let Some(created) = record.content_created() {
        metadata.add_property(PROP_CREATED, created);
    }
    if let Some(modified) = record.content_modified() {
        metadata.add_property(PROP_MODIFIED, modified);
    }
    metadata
}

/// Reads metadata files for the importer.
pub trait MetadataLoader: Send + Sync {
    /// Extension of metadata files, without the leading `.metadata.` infix.
    fn metadata_file_extension(&self) -> &str;

    /// Merge the metadata declared for `record` into `metadata`.
    ///
    /// Records without a metadata file leave `metadata` untouched.
    fn load_metadata(&self, record: &ContentAndMetadata, metadata: &mut Metadata) -> Result<()>;
}

/// Reads a metadata file into a flat key/value map.
pub type MapReader = dyn Fn(&Path) -> Result<BTreeMap<String, String>> + Send + Sync;

/// A [`MetadataLoader`] over any file format that reads as a flat map.
///
/// A handful of keys are interpreted rather than stored as properties:
///
/// | Key | Effect |
/// |---|---|
/// | `separator` | separator for multi-valued keys (default `,`) |
/// | `type` | node type |
/// | `aspects` | separator-delimited aspect names |
/// | `parentAssociation` | association used to attach the node to its parent |
/// | `versionComment` | comment for the revision |
/// | `versionType` | `major` or `minor`, forcing the revision kind |
///
/// Every other key becomes a property. Keys registered as multi-valued are
/// split on the separator into a list. For date-like keys, the value `NOW`
/// becomes the current time and RFC 3339 values are parsed as timestamps.
pub struct MapBasedMetadataLoader {
    extension: String,
    default_separator: String,
    multi_valued: BTreeSet<String>,
    reader: Box<MapReader>,
}

impl MapBasedMetadataLoader {
    pub const KEY_SEPARATOR: &'static str = "separator";
    pub const KEY_TYPE: &'static str = "type";
    pub const KEY_ASPECTS: &'static str = "aspects";
    pub const KEY_PARENT_ASSOCIATION: &'static str = "parentAssociation";
    pub const KEY_VERSION_COMMENT: &'static str = "versionComment";
    pub const KEY_VERSION_TYPE: &'static str = "versionType";
    pub const DEFAULT_SEPARATOR: &'static str = ",";

    pub fn new<F>(extension: impl Into<String>, reader: F) -> Self
    where
        F: Fn(&Path) -> Result<BTreeMap<String, String>> + Send + Sync + 'static,
    {
        Self {
            extension: extension.into(),
            default_separator: Self::DEFAULT_SEPARATOR.to_string(),
            multi_valued: BTreeSet::new(),
            reader: Box::new(reader),
        }
    }

    /// Loader for `<name>.metadata.json` files holding one flat JSON object.
    pub fn json() -> Self {
        Self::new("json", read_json_map)
    }

    pub fn with_default_separator(mut self, separator: impl Into<String>) -> Self {
        self.default_separator = separator.into();
        self
    }

    /// Treat `key` as multi-valued.
    pub fn with_multi_valued(mut self, key: impl Into<String>) -> Self {
        self.multi_valued.insert(key.into());
        self
    }

    fn apply(&self, mut map: BTreeMap<String, String>, metadata: &mut Metadata) {
        let separator = map
            .remove(Self::KEY_SEPARATOR)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.default_separator.clone());

        if let Some(node_type) = map.remove(Self::KEY_TYPE) {
            metadata.set_type(node_type.trim());
        }
        if let Some(aspects) = map.remove(Self::KEY_ASPECTS) {
            aspects
                .split(separator.as_str())
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .for_each(|a| metadata.add_aspect(a));
        }
        if let Some(association) = map.remove(Self::KEY_PARENT_ASSOCIATION) {
            metadata.set_parent_association(association.trim());
        }
        if let Some(comment) = map.remove(Self::KEY_VERSION_COMMENT) {
            metadata.set_version_comment(comment);
        }
        if let Some(version_type) = map.remove(Self::KEY_VERSION_TYPE) {
            match VersionKind::parse(&version_type) {
                Some(kind) => metadata.set_version_type(kind),
                None => warn!("Ignoring unknown version type '{}'", version_type),
            }
        }

        for (key, value) in map {
            let value = if self.multi_valued.contains(&key) {
                PropertyValue::List(
                    value
                        .split(separator.as_str())
                        .map(|v| map_value(&key, v.trim()))
                        .collect(),
                )
            } else {
                map_value(&key, &value)
            };
            metadata.add_property(key, value);
        }
    }
}

impl std::fmt::Debug for MapBasedMetadataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapBasedMetadataLoader")
            .field("extension", &self.extension)
            .field("default_separator", &self.default_separator)
            .field("multi_valued", &self.multi_valued)
            .finish_non_exhaustive()
    }
}

impl MetadataLoader for MapBasedMetadataLoader {
    fn metadata_file_extension(&self) -> &str {
        &self.extension
    }

    fn load_metadata(&self, record: &ContentAndMetadata, metadata: &mut Metadata) -> Result<()> {
        let Some(path) = record.metadata_file() else {
            return Ok(());
        };

        if File::open(path).is_err() {
            warn!("Metadata file '{}' is not readable", path.display());
            return Ok(());
        }

        let map = (self.reader)(path)?;
        self.apply(map, metadata);
        Ok(())
    }
}

fn is_date_like(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.contains("date") || key.ends_with("created") || key.ends_with("modified")
}

fn map_value(key: &str, value: &str) -> PropertyValue {
    if is_date_like(key) {
        if value.eq_ignore_ascii_case("NOW") {
            return PropertyValue::DateTime(Utc::now());
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return PropertyValue::DateTime(parsed.with_timezone(&Utc));
        }
    }
    PropertyValue::Text(value.to_string())
}

/// Read a flat JSON object, rendering non-string scalars as text.
fn read_json_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .map_err(|e| ImportError::io_with_path(e, path))?;

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&contents)
        .map_err(|e| ImportError::Metadata {
            path: path.to_path_buf(),
            message: format!("Failed to parse metadata: {}", e),
        })?;

    let mut map = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => continue,
            serde_json::Value::Array(values) => values
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(MapBasedMetadataLoader::DEFAULT_SEPARATOR),
            other => other.to_string(),
        };
        map.insert(key, text);
    }
    Ok(map)
}
