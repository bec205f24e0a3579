//! Pluggable exclusion rules applied to analysed items before batching.

use crate::item::ImportableItem;
use crate::{ImportError, Result};
use regex::Regex;

/// Decides whether an item is left out of the import.
pub trait ImportFilter: Send + Sync {
    /// True if `item` must not be imported.
    fn should_exclude(&self, item: &ImportableItem) -> bool;
}

impl<F> ImportFilter for F
where
    F: Fn(&ImportableItem) -> bool + Send + Sync,
{
    fn should_exclude(&self, item: &ImportableItem) -> bool {
        self(item)
    }
}

/// Excludes items whose head revision has no content file, i.e. items that
/// only carry metadata or version history.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonExistentContentFilter;

impl ImportFilter for NonExistentContentFilter {
    fn should_exclude(&self, item: &ImportableItem) -> bool {
        !item.head_revision().content_exists()
    }
}

/// Excludes items whose base file name matches a regular expression.
#[derive(Debug, Clone)]
pub struct FileNamePatternFilter {
    pattern: Regex,
}

impl FileNamePatternFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| ImportError::Validation {
            field: "pattern".into(),
            message: e.to_string(),
        })?;
        Ok(Self { pattern })
    }
}

impl ImportFilter for FileNamePatternFilter {
    fn should_exclude(&self, item: &ImportableItem) -> bool {
        item.file_name()
            .is_some_and(|name| self.pattern.is_match(name))
    }
}
