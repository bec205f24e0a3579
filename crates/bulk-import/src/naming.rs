//! Filename conventions recognised by the directory analyser.
//!
//! - Version file: `<base>.v<major>[.<minor>]`, e.g. `report.txt.v2` or
//!   `report.txt.v1.3`. A missing minor number is treated as `0`.
//! - Metadata file: `<base>.metadata.<ext>`, where `<ext>` is supplied by the
//!   metadata loader (e.g. `report.txt.metadata.properties`).
//! - Metadata version file: `<base>.metadata.<ext>.v<major>[.<minor>]`.

use crate::config::ImportConfig;
use crate::item::VersionId;
use regex::Regex;
use std::sync::LazyLock;

/// Matches a version suffix at the end of a file name.
static VERSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.v(\d+)(?:\.(\d+))?$").unwrap());

/// Split a version file name into its nominal parent name and version.
///
/// Returns `None` when the name carries no version suffix, or when the version
/// numbers don't fit in a `u32`.
///
/// # Examples
///
/// ```
/// use bulk_import::naming::parse_version_suffix;
/// use bulk_import::item::VersionId;
///
/// let (base, version) = parse_version_suffix("report.txt.v1.2").unwrap();
/// assert_eq!(base, "report.txt");
/// assert_eq!(version, VersionId::new(1, 2));
/// assert!(parse_version_suffix("report.txt").is_none());
/// ```
pub fn parse_version_suffix(file_name: &str) -> Option<(&str, VersionId)> {
    let captures = VERSION_SUFFIX.captures(file_name)?;
    let base = captures.get(1)?.as_str();
    let major = captures.get(2)?.as_str().parse::<u32>().ok()?;
    let minor = match captures.get(3) {
        Some(minor) => minor.as_str().parse::<u32>().ok()?,
        None => 0,
    };
    Some((base, VersionId::new(major, minor)))
}

/// True if the file name ends with a version suffix.
pub fn is_version_file_name(file_name: &str) -> bool {
    parse_version_suffix(file_name).is_some()
}

/// Remove a trailing version suffix, if present.
pub fn strip_version_suffix(file_name: &str) -> &str {
    parse_version_suffix(file_name)
        .map(|(base, _)| base)
        .unwrap_or(file_name)
}

/// Full metadata suffix for an extension, e.g. `.metadata.properties`.
pub fn metadata_suffix(extension: &str) -> String {
    format!("{}{}", ImportConfig::METADATA_SUFFIX, extension)
}

/// Remove the metadata suffix from a file name.
///
/// Returns `None` if the name isn't a metadata file for `extension`, or if
/// nothing would remain of the name once the suffix is removed.
pub fn strip_metadata_suffix<'a>(file_name: &'a str, extension: &str) -> Option<&'a str> {
    let suffix = metadata_suffix(extension);
    file_name
        .strip_suffix(suffix.as_str())
        .filter(|base| !base.is_empty())
}

/// True if the file name is a metadata file for `extension`.
pub fn is_metadata_file_name(file_name: &str, extension: &str) -> bool {
    strip_metadata_suffix(file_name, extension).is_some()
}
