//! Error types for todoist-backup
//!
//! Remote, storage and configuration failures are all converted to
//! `AppError`. Run-level aggregation lives in `service::SyncError`.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote answered with a status outside 200..=399
    #[error("unexpected http status {status} from {url}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    /// Object storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Stored key does not encode a backup version
    #[error("parsing version from key {0:?}")]
    InvalidKey(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation interrupted by shutdown
    #[error("operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
