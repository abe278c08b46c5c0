//! Prometheus metrics registry and instruments.
//!
//! There is no HTTP listener; the registry can be written out as a
//! textfile for node_exporter's textfile collector after each run.

use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::path::Path;
use std::sync::Once;

use crate::error::AppError;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref SYNC_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("todoist_backup_sync_runs_total", "Total number of sync runs"),
        &["status"]
    ).expect("metric can be created");
    pub static ref SYNC_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "todoist_backup_sync_duration_seconds",
            "Sync run duration in seconds"
        ).buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["status"]
    ).expect("metric can be created");
    pub static ref TRANSFERS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("todoist_backup_transfers_total", "Total number of backup transfers"),
        &["status"]
    ).expect("metric can be created");
    pub static ref BYTES_STORED_TOTAL: IntCounter = IntCounter::new(
        "todoist_backup_bytes_stored_total",
        "Total bytes of backups written to storage"
    ).expect("metric can be created");
    pub static ref STORED_VERSIONS: IntGauge = IntGauge::new(
        "todoist_backup_stored_versions",
        "Number of backup versions present in storage after the last run"
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(SYNC_RUNS_TOTAL.clone()))
            .expect("SYNC_RUNS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SYNC_DURATION_SECONDS.clone()))
            .expect("SYNC_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(TRANSFERS_TOTAL.clone()))
            .expect("TRANSFERS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(BYTES_STORED_TOTAL.clone()))
            .expect("BYTES_STORED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(STORED_VERSIONS.clone()))
            .expect("STORED_VERSIONS can be registered");

        tracing::debug!("Metrics registry initialized");
    });
}

/// Render all registered metrics in Prometheus text format
pub fn render() -> Result<String, AppError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    encoder
        .encode_to_string(&metric_families)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))
}

/// Write the rendered registry to `path`
///
/// Writes a sibling temp file first and renames it over the target,
/// so collectors never read a half-written file.
pub async fn write_textfile(path: &Path) -> Result<(), AppError> {
    let text = render()?;

    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");

    tokio::fs::write(&temp_path, text).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
