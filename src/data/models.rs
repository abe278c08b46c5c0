//! Backup data models
//!
//! Records exchanged between the remote source, the sync engine
//! and object storage.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::AppError;

// =============================================================================
// Backup Descriptor
// =============================================================================

/// One backup archive as listed by `GET /backups/get`
///
/// The version string is the stable dedup key; the URL is only
/// valid for downloading.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackupDescriptor {
    /// Download location of the archive
    pub url: String,
    /// Human-readable revision, e.g. "2024-01-01 10:30"
    pub version: String,
}

// =============================================================================
// Backup Metadata
// =============================================================================

/// Response metadata captured while downloading an archive
///
/// The list endpoint does not expose any of this, so it only
/// exists once a download has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupMetadata {
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    /// Content-Length, when the server sent one
    pub size: Option<u64>,
}

// =============================================================================
// Backup Download
// =============================================================================

/// Byte stream of an archive being downloaded
pub type BackupBody = BoxStream<'static, Result<Bytes, AppError>>;

/// An in-flight archive download
pub struct BackupDownload {
    /// Parsed response metadata, `None` if the headers were unusable
    pub metadata: Option<BackupMetadata>,
    /// Archive bytes
    pub body: BackupBody,
}

impl BackupDownload {
    pub fn new(metadata: Option<BackupMetadata>, body: BackupBody) -> Self {
        Self { metadata, body }
    }
}

impl fmt::Debug for BackupDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupDownload")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Version Set
// =============================================================================

/// Versions already present in storage
///
/// Rebuilt by enumerating the bucket on every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSet(BTreeSet<String>);

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, version: &str) -> bool {
        self.0.contains(version)
    }

    /// Returns `false` if the version was already present
    pub fn insert(&mut self, version: impl Into<String>) -> bool {
        self.0.insert(version.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Descriptors whose version is not in this set, in listing order
    pub fn missing<'a>(&self, backups: &'a [BackupDescriptor]) -> Vec<&'a BackupDescriptor> {
        backups
            .iter()
            .filter(|backup| !self.contains(&backup.version))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for VersionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}
