//! Backup object storage
//!
//! Handles:
//! - Enumerating stored backup versions
//! - Writing new archives to an S3-compatible bucket

mod keys;
mod s3;

pub use keys::{
    KEY_PREFIX, KEY_SUFFIX, VERSION_METADATA_KEY, collect_versions, key_from_version,
    resolve_version, version_from_key,
};
pub use s3::{PART_SIZE, S3BackupStore};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::data::{BackupDescriptor, BackupDownload, VersionSet};
use crate::error::AppError;

/// Destination of mirrored backups
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Enumerate the versions already stored
    async fn list_versions(&self) -> Result<VersionSet, AppError>;

    /// Stream one archive into storage under its derived key
    ///
    /// Implementations watch `cancel` themselves and clean up any
    /// partially written object before returning `AppError::Cancelled`.
    ///
    /// # Returns
    /// Number of bytes written
    async fn put_backup(
        &self,
        backup: &BackupDescriptor,
        download: BackupDownload,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError>;
}

pub(crate) fn build_s3_http_client() -> aws_sdk_s3::config::SharedHttpClient {
    use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;

    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    HyperClientBuilder::new().build(https_connector)
}
