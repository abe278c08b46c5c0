//! Version <-> object key mapping
//!
//! Keys are derived from version strings so that older objects
//! without a `version` metadata tag can still be recognized.

use std::collections::HashMap;

use crate::data::VersionSet;
use crate::error::AppError;

/// Prefix of every backup object key
pub const KEY_PREFIX: &str = "todoist-backup-";
/// Suffix of every backup object key
pub const KEY_SUFFIX: &str = ".zip";
/// User metadata entry holding the original version string
pub const VERSION_METADATA_KEY: &str = "version";

/// Derive the object key for a backup version
///
/// # Example
/// ```
/// use todoist_backup::storage::key_from_version;
///
/// assert_eq!(
///     key_from_version("2024-01-01 10:30"),
///     "todoist-backup-2024-01-01-10-30.zip"
/// );
/// ```
pub fn key_from_version(version: &str) -> String {
    let sanitized = version.replace([' ', ':'], "-");
    format!("{}{}{}", KEY_PREFIX, sanitized, KEY_SUFFIX)
}

/// Reconstruct a version string from an object key
///
/// Positional: the stripped key must hold exactly five hyphen
/// separated segments, read back as `"{0}-{1}-{2} {3}:{4}"`.
///
/// # Errors
/// Returns `AppError::InvalidKey` for any other shape
pub fn version_from_key(key: &str) -> Result<String, AppError> {
    let stripped = key.strip_prefix(KEY_PREFIX).unwrap_or(key);
    let stripped = stripped.strip_suffix(KEY_SUFFIX).unwrap_or(stripped);

    match stripped.split('-').collect::<Vec<_>>().as_slice() {
        [year, month, day, hour, minute] => {
            Ok(format!("{}-{}-{} {}:{}", year, month, day, hour, minute))
        }
        _ => Err(AppError::InvalidKey(stripped.to_string())),
    }
}

/// Resolve the version of a stored object
///
/// The `version` metadata tag wins; the key is only parsed when the
/// tag is missing or empty.
pub fn resolve_version(
    key: &str,
    metadata: Option<&HashMap<String, String>>,
) -> Result<String, AppError> {
    let tagged = metadata.and_then(|metadata| {
        metadata
            .iter()
            .find(|(name, value)| {
                name.eq_ignore_ascii_case(VERSION_METADATA_KEY) && !value.is_empty()
            })
            .map(|(_, value)| value.clone())
    });

    match tagged {
        Some(version) => Ok(version),
        None => version_from_key(key),
    }
}

/// Build a version set from stored objects
///
/// Objects whose version cannot be resolved are logged and skipped.
pub fn collect_versions<I>(objects: I) -> VersionSet
where
    I: IntoIterator<Item = (String, Option<HashMap<String, String>>)>,
{
    let mut versions = VersionSet::new();

    for (key, metadata) in objects {
        match resolve_version(&key, metadata.as_ref()) {
            Ok(version) => {
                versions.insert(version);
            }
            Err(error) => {
                tracing::warn!(key = %key, %error, "Skipping object without backup version");
            }
        }
    }

    versions
}
