//! Groups a directory listing into importable items.
//!
//! Each entry is classified, first match wins:
//! 1. version file (`<base>.v<n>`): a content version of `<base>`, or a
//!    metadata version when `<base>` is itself a metadata file name
//! 2. metadata file (`<base>.metadata.<ext>`): head metadata of `<base>`
//! 3. anything else: head content, file or directory
//!
//! Entries resolving to the same base path land on the same item.

use crate::item::{ImportableItem, VersionId};
use crate::naming;
use crate::status::ImportStatus;
use crate::{ImportError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Result of analysing one directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysedDirectory {
    /// Every entry of the directory, sorted by file name.
    pub original_listing: Vec<PathBuf>,
    /// Valid items, in order of first appearance in the listing.
    pub importable_items: Vec<ImportableItem>,
}

/// Classifies directory listings and records scan counters.
#[derive(Debug, Clone)]
pub struct DirectoryAnalyser {
    metadata_extension: Option<String>,
    status: Arc<ImportStatus>,
}

/// What a single directory entry contributes to an item.
enum EntryRole<'a> {
    ContentVersion { base: &'a str, version: VersionId },
    MetadataVersion { base: &'a str, version: VersionId },
    Metadata { base: &'a str },
    Content,
}

impl DirectoryAnalyser {
    /// Without a metadata extension no entry is treated as a metadata file.
    pub fn new(metadata_extension: Option<String>, status: Arc<ImportStatus>) -> Self {
        Self {
            metadata_extension,
            status,
        }
    }

    pub fn analyse_directory(&self, directory: &Path) -> Result<AnalysedDirectory> {
        debug!("Analysing directory {}", directory.display());

        fs::read_dir(directory).map_err(|e| ImportError::io_with_path(e, directory))?;

        let mut result = AnalysedDirectory::default();
        let mut index: HashMap<PathBuf, usize> = HashMap::new();

        let walker = WalkDir::new(directory)
            .min_depth(1)
            .max_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let path = match entry {
                Ok(entry) => entry.into_path(),
                Err(err) => {
                    warn!("Skipping unreadable entry in {}: {}", directory.display(), err);
                    self.status.increment_unreadable_entries();
                    continue;
                }
            };
            result.original_listing.push(path.clone());
            trace!("Scanning {}", path.display());

            if !is_readable(&path) {
                warn!("Skipping unreadable file '{}'", path.display());
                self.status.increment_unreadable_entries();
                continue;
            }

            let items = &mut result.importable_items;
            match self.classify(&path) {
                EntryRole::ContentVersion { base, version } => {
                    let item = find_or_create(items, &mut index, sibling(&path, base));
                    item.version_entry_mut(version)
                        .record_mut()
                        .set_content_file(&path);
                    self.status.increment_files_scanned();
                }
                EntryRole::MetadataVersion { base, version } => {
                    let item = find_or_create(items, &mut index, sibling(&path, base));
                    item.version_entry_mut(version)
                        .record_mut()
                        .set_metadata_file(&path);
                    self.status.increment_files_scanned();
                }
                EntryRole::Metadata { base } => {
                    let item = find_or_create(items, &mut index, sibling(&path, base));
                    item.head_revision_mut().set_metadata_file(&path);
                    self.status.increment_files_scanned();
                }
                EntryRole::Content => {
                    let item = find_or_create(items, &mut index, path.clone());
                    item.head_revision_mut().set_content_file(&path);
                    if item.is_directory() {
                        self.status.increment_folders_scanned();
                    } else {
                        self.status.increment_files_scanned();
                    }
                }
            }
        }

        let before = result.importable_items.len();
        result.importable_items.retain(ImportableItem::is_valid);
        debug!(
            "Finished analysing {}: {} entries, {} items ({} discarded as empty)",
            directory.display(),
            result.original_listing.len(),
            result.importable_items.len(),
            before - result.importable_items.len()
        );
        Ok(result)
    }

    fn classify<'a>(&self, path: &'a Path) -> EntryRole<'a> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return EntryRole::Content;
        };

        if let Some((parent_name, version)) = naming::parse_version_suffix(file_name) {
            return match self.metadata_base(parent_name) {
                Some(base) => EntryRole::MetadataVersion { base, version },
                None => EntryRole::ContentVersion {
                    base: parent_name,
                    version,
                },
            };
        }
        match self.metadata_base(file_name) {
            Some(base) => EntryRole::Metadata { base },
            None => EntryRole::Content,
        }
    }

    fn metadata_base<'a>(&self, file_name: &'a str) -> Option<&'a str> {
        let extension = self.metadata_extension.as_deref()?;
        naming::strip_metadata_suffix(file_name, extension)
    }
}

fn sibling(path: &Path, name: &str) -> PathBuf {
    path.with_file_name(name)
}

fn find_or_create<'a>(
    items: &'a mut Vec<ImportableItem>,
    index: &mut HashMap<PathBuf, usize>,
    base_path: PathBuf,
) -> &'a mut ImportableItem {
    let position = *index.entry(base_path.clone()).or_insert_with(|| {
        items.push(ImportableItem::new(base_path));
        items.len() - 1
    });
    &mut items[position]
}

fn is_readable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => fs::read_dir(path).is_ok(),
        Ok(meta) if meta.is_file() => fs::File::open(path).is_ok(),
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ImportType;
    use tempfile::TempDir;

    fn analyser(extension: Option<&str>) -> (DirectoryAnalyser, Arc<ImportStatus>) {
        let status = Arc::new(ImportStatus::new());
        status
            .start_import(Path::new("/src"), "/", ImportType::Streaming, 100)
            .unwrap();
        (
            DirectoryAnalyser::new(extension.map(str::to_string), Arc::clone(&status)),
            status,
        )
    }

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), name.as_bytes()).unwrap();
    }

    #[test]
    fn test_metadata_pairing() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "report.txt");
        touch(temp_dir.path(), "report.txt.metadata.properties");

        let (analyser, status) = analyser(Some("properties"));
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(result.original_listing.len(), 2);
        assert_eq!(result.importable_items.len(), 1);
        let item = &result.importable_items[0];
        assert_eq!(item.weight(), 2);
        assert!(item.head_revision().content_exists());
        assert!(item.head_revision().metadata_exists());
        assert_eq!(status.files_scanned(), 2);
    }

    #[test]
    fn test_without_extension_metadata_is_content() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "report.txt");
        touch(temp_dir.path(), "report.txt.metadata.properties");

        let (analyser, _) = analyser(None);
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();
        assert_eq!(result.importable_items.len(), 2);
    }

    #[test]
    fn test_versions_and_metadata_versions() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "report.txt");
        touch(temp_dir.path(), "report.txt.v2");
        touch(temp_dir.path(), "report.txt.v1");
        touch(temp_dir.path(), "report.txt.metadata.json.v1");

        let (analyser, _) = analyser(Some("json"));
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(result.importable_items.len(), 1);
        let item = &result.importable_items[0];
        assert_eq!(item.base_path(), temp_dir.path().join("report.txt"));
        let versions: Vec<_> = item.version_entries().collect();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version(), VersionId::new(1, 0));
        assert!(versions[0].record().content_exists());
        assert!(versions[0].record().metadata_exists());
        assert_eq!(versions[1].version(), VersionId::new(2, 0));
        assert!(!versions[1].record().metadata_exists());
        assert_eq!(item.weight(), 4);
    }

    #[test]
    fn test_analysis_is_repeatable() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        touch(temp_dir.path(), "report.txt");
        touch(temp_dir.path(), "report.txt.v1");
        touch(temp_dir.path(), "report.txt.v1.1");
        touch(temp_dir.path(), "report.txt.metadata.json");
        touch(temp_dir.path(), "report.txt.metadata.json.v1");
        touch(temp_dir.path(), "orphan.txt.v3");
        touch(temp_dir.path(), "notes.md");

        let (analyser, _) = analyser(Some("json"));
        let first = analyser.analyse_directory(temp_dir.path()).unwrap();
        let second = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(first.importable_items.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn test_orphan_version_creates_item() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "gone.txt.v2");

        let (analyser, _) = analyser(None);
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(result.importable_items.len(), 1);
        let item = &result.importable_items[0];
        assert!(!item.head_revision().content_exists());
        assert_eq!(
            item.version_entries().map(|v| v.version()).collect::<Vec<_>>(),
            vec![VersionId::new(2, 0)]
        );
    }

    #[test]
    fn test_directories_counted_as_folders() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();
        touch(temp_dir.path(), "a.txt");

        let (analyser, status) = analyser(None);
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(result.importable_items.len(), 2);
        assert!(result.importable_items.iter().any(|i| i.is_directory()));
        assert_eq!(status.folders_scanned(), 2);
        assert_eq!(status.files_scanned(), 1);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let (analyser, _) = analyser(None);
        let err = analyser
            .analyse_directory(&temp_dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, ImportError::Io { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_symlink_is_unreadable() {
        let temp_dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("missing-target"),
            temp_dir.path().join("dangling"),
        )
        .unwrap();
        touch(temp_dir.path(), "ok.txt");

        let (analyser, status) = analyser(None);
        let result = analyser.analyse_directory(temp_dir.path()).unwrap();

        assert_eq!(result.importable_items.len(), 1);
        assert_eq!(status.unreadable_entries(), 1);
    }
}
