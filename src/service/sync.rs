//! Backup synchronization
//!
//! Lists remote backups, diffs them against storage and transfers the
//! missing ones concurrently. A failed transfer never stops its
//! siblings; all failures are reported together once the wave is done.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::data::BackupDescriptor;
use crate::error::AppError;
use crate::metrics::{
    BYTES_STORED_TOTAL, STORED_VERSIONS, SYNC_DURATION_SECONDS, SYNC_RUNS_TOTAL, TRANSFERS_TOTAL,
};
use crate::remote::BackupSource;
use crate::storage::BackupStore;

/// Outcome of a successful sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Backups offered by the remote source
    pub listed: usize,
    /// Backups that were not yet stored
    pub missing: usize,
    /// Growth of the stored version set
    pub added: usize,
}

/// A single failed transfer
#[derive(Debug, Error)]
#[error("backup {version:?}: {error}")]
pub struct TransferError {
    pub version: String,
    #[source]
    pub error: AppError,
}

/// Sync run failure
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote source could not be listed
    #[error("listing todoist backups: {0}")]
    ListRemote(#[source] AppError),

    /// Storage could not be enumerated
    #[error("listing backups in storage: {0}")]
    ListStored(#[source] AppError),

    /// One or more transfers failed
    #[error("downloading backups: {}", join_failures(.0))]
    Transfers(Vec<TransferError>),
}

impl SyncError {
    /// Failed transfers, empty for listing errors
    pub fn transfer_failures(&self) -> &[TransferError] {
        match self {
            SyncError::Transfers(failures) => failures,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[TransferError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run `future` unless `cancel` fires first
async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = future => result,
    }
}

/// Download one backup and stream it into storage
///
/// The storage write is never dropped mid-flight; the store sees
/// `cancel` and aborts its own partial upload.
///
/// # Returns
/// Number of bytes stored
pub async fn fetch_backup(
    source: &dyn BackupSource,
    store: &dyn BackupStore,
    backup: &BackupDescriptor,
    cancel: &CancellationToken,
) -> Result<u64, AppError> {
    let download = cancellable(cancel, source.download(backup)).await?;
    store.put_backup(backup, download, cancel).await
}

/// Mirrors remote backups into storage
#[derive(Clone)]
pub struct SyncEngine {
    source: Arc<dyn BackupSource>,
    store: Arc<dyn BackupStore>,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn BackupSource>, store: Arc<dyn BackupStore>) -> Self {
        Self { source, store }
    }

    /// Perform one sync run
    ///
    /// # Steps
    /// 1. List remote backups
    /// 2. List stored versions
    /// 3. Transfer every missing backup in its own task
    /// 4. Collect all transfer failures
    /// 5. Re-list storage and report what was added
    ///
    /// # Errors
    /// Listing failures abort the run; transfer failures are returned
    /// together as `SyncError::Transfers` after every task finished
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let result = self.sync(cancel).await;

        let status = if result.is_ok() { "success" } else { "failure" };
        SYNC_RUNS_TOTAL.with_label_values(&[status]).inc();
        SYNC_DURATION_SECONDS
            .with_label_values(&[status])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport, SyncError> {
        let backups = cancellable(cancel, self.source.list_backups())
            .await
            .map_err(SyncError::ListRemote)?;
        tracing::info!(count = backups.len(), "Found potentially new backups");

        let existing = cancellable(cancel, self.store.list_versions())
            .await
            .map_err(SyncError::ListStored)?;

        let missing: Vec<BackupDescriptor> =
            existing.missing(&backups).into_iter().cloned().collect();
        let missing_count = missing.len();
        tracing::info!(
            stored = existing.len(),
            missing = missing_count,
            "Starting download of missing backups"
        );

        let failures = self.transfer_all(missing, cancel).await;
        if !failures.is_empty() {
            return Err(SyncError::Transfers(failures));
        }

        let versions = cancellable(cancel, self.store.list_versions())
            .await
            .map_err(SyncError::ListStored)?;
        STORED_VERSIONS.set(versions.len() as i64);

        let added = versions.len().saturating_sub(existing.len());
        tracing::info!(added, "Added new backups to storage");

        Ok(SyncReport {
            listed: backups.len(),
            missing: missing_count,
            added,
        })
    }

    /// Spawn one task per backup and wait for all of them
    async fn transfer_all(
        &self,
        missing: Vec<BackupDescriptor>,
        cancel: &CancellationToken,
    ) -> Vec<TransferError> {
        let handles: Vec<_> = missing
            .into_iter()
            .map(|backup| {
                let source = Arc::clone(&self.source);
                let store = Arc::clone(&self.store);
                let cancel = cancel.clone();
                let version = backup.version.clone();

                let handle = tokio::spawn(async move {
                    fetch_backup(source.as_ref(), store.as_ref(), &backup, &cancel).await
                });
                (version, handle)
            })
            .collect();

        let mut failures = Vec::new();
        for (version, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(AppError::Internal(anyhow::anyhow!(
                    "transfer task failed: {}",
                    join_error
                ))),
            };

            match result {
                Ok(bytes) => {
                    TRANSFERS_TOTAL.with_label_values(&["success"]).inc();
                    BYTES_STORED_TOTAL.inc_by(bytes);
                    tracing::info!(version = %version, bytes, "Written backup to storage");
                }
                Err(error) => {
                    TRANSFERS_TOTAL.with_label_values(&["failure"]).inc();
                    tracing::warn!(version = %version, %error, "Backup transfer failed");
                    failures.push(TransferError { version, error });
                }
            }
        }

        failures
    }
}
