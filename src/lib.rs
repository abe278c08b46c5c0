//! todoist-backup - mirrors Todoist backups into S3-compatible storage
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   Remote Source      │        │   Backup Store       │
//! │  - Todoist API       │        │  - S3 / MinIO / R2   │
//! │  - list + download   │        │  - list + put        │
//! └──────────┬───────────┘        └───────────┬──────────┘
//!            │                                │
//! ┌──────────┴────────────────────────────────┴──────────┐
//! │                    Sync Engine                        │
//! │  - diff remote versions against stored versions      │
//! │  - one task per missing backup, failures aggregated  │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────┴───────────────────────────┐
//! │            Scheduler (daemon mode only)              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `remote`: Todoist export API client
//! - `storage`: S3 backup store and key mapping
//! - `service`: Sync engine and scheduler
//! - `data`: Shared records
//! - `config`: Configuration management
//! - `metrics`: Prometheus instruments
//! - `error`: Error types

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod remote;
pub mod service;
pub mod storage;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Fully wired application
///
/// Owns the configuration and a sync engine connected to the
/// Todoist API and the configured bucket.
#[derive(Clone)]
pub struct App {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Sync engine (Todoist -> S3)
    pub engine: service::SyncEngine,
}

impl App {
    /// Initialize the application
    ///
    /// # Steps
    /// 1. Build the Todoist API client
    /// 2. Connect to the bucket, creating it if needed
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application...");

        let source = remote::TodoistClient::new(&config.client)?;
        let store = storage::S3BackupStore::connect(&config.store).await?;
        tracing::info!(bucket = %config.store.bucket, "Storage ready");

        Ok(Self::with_engine(
            config,
            service::SyncEngine::new(Arc::new(source), Arc::new(store)),
        ))
    }

    /// Assemble the application around an existing engine
    pub fn with_engine(config: config::AppConfig, engine: service::SyncEngine) -> Self {
        Self {
            config: Arc::new(config),
            engine,
        }
    }

    /// Perform one sync run and export metrics
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<service::SyncReport, service::SyncError> {
        let result = self.engine.run(cancel).await;

        if let Some(path) = &self.config.metrics.textfile {
            if let Err(error) = metrics::write_textfile(path).await {
                tracing::warn!(%error, path = %path.display(), "Failed to write metrics textfile");
            }
        }

        result
    }

    /// Sync on the configured interval until cancelled
    ///
    /// Failed runs are logged and do not stop the loop.
    pub async fn run_daemon(&self, cancel: CancellationToken) {
        let interval = self.config.daemon.interval();
        tracing::info!(interval_secs = interval.as_secs(), "Running in daemon mode");

        let app = self;
        let token = &cancel;
        service::run_every(interval, cancel.clone(), move || async move {
            tracing::info!("Running scheduled backup...");
            match app.run_once(token).await {
                Ok(report) => tracing::info!(
                    listed = report.listed,
                    added = report.added,
                    "Backup run completed"
                ),
                Err(error) => tracing::error!(%error, "Backup run failed"),
            }
        })
        .await;
    }
}
