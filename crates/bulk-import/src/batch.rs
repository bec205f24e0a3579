//! Filtering and weight-bounded batching of analysed items.

use crate::filter::ImportFilter;
use crate::item::ImportableItem;
use tracing::trace;

/// Drop every item that at least one filter excludes.
///
/// Filters run in order and stop at the first exclusion. With no filters the
/// items pass through untouched.
pub fn filter_items(
    items: Vec<ImportableItem>,
    filters: &[Box<dyn ImportFilter>],
) -> Vec<ImportableItem> {
    if filters.is_empty() {
        return items;
    }
    items
        .into_iter()
        .filter(|item| {
            let excluded = filters.iter().any(|f| f.should_exclude(item));
            if excluded {
                trace!("Filtered out {}", item);
            }
            !excluded
        })
        .collect()
}

/// Pack items, in order, into batches of at least `weight_limit`.
///
/// A batch closes right after the item that brings its weight to or past the
/// limit. Only the last batch may fall short, and no batch is ever empty.
/// A zero limit behaves like a limit of one.
pub fn batch_items(items: Vec<ImportableItem>, weight_limit: usize) -> Vec<Vec<ImportableItem>> {
    let weight_limit = weight_limit.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut weight = 0;

    for item in items {
        weight += item.weight();
        current.push(item);
        if weight >= weight_limit {
            batches.push(std::mem::take(&mut current));
            weight = 0;
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
