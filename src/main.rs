//! todoistbackup binary entry point

use clap::Parser;
use std::process::ExitCode;
use todoist_backup::config::{AppConfig, CliArgs, LoggingConfig};
use todoist_backup::{App, metrics};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Parse flags and load configuration
/// 2. Initialize tracing/logging
/// 3. Connect to Todoist and storage
/// 4. Sync once, or forever in daemon mode
#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    // 1. Load configuration; logging comes from flags if that fails
    let config = AppConfig::load(&args);
    let logging = match &config {
        Ok(config) => config.logging.clone(),
        Err(_) => LoggingConfig::from_args(&args),
    };

    // 2. Initialize tracing/logging
    init_tracing(&logging);

    let config = match config {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, "Loading configuration failed");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        bucket = %config.store.bucket,
        endpoint = %config.store.endpoint,
        daemon = config.daemon.enabled,
        "Configuration loaded"
    );

    metrics::init_metrics();

    // 3. Initialize application
    let app = match App::new(config).await {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(%error, "Initialization failed");
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    spawn_shutdown_task(cancel.clone());

    // 4. Run
    if app.config.daemon.enabled {
        app.run_daemon(cancel).await;
        return ExitCode::SUCCESS;
    }

    match app.run_once(&cancel).await {
        Ok(report) => {
            tracing::info!(
                listed = report.listed,
                missing = report.missing,
                added = report.added,
                "Backup completed successfully"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "Backup failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| "info".into());

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM
fn spawn_shutdown_task(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(%error, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{SignalKind, signal};

            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(error) => {
                    tracing::warn!(%error, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }

        cancel.cancel();
    });
}
