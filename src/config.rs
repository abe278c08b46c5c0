//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (`config.json` unless `--config.file` is given)
//! 3. Command-line flags and `TODOISTBACKUP_*` environment variables

use clap::Parser;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

/// Todoist sync API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.todoist.com/sync/v9";
/// Config file loaded when none is given explicitly
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub store: StoreConfig,
    pub daemon: DaemonConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Todoist API client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// API integration token
    pub token: String,
    /// Request timeout in seconds (default: 5)
    pub timeout: u64,
    /// API base URL
    pub base_url: String,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// S3-compatible storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Bucket holding the mirrored archives
    pub bucket: String,
    /// Endpoint address, with or without scheme (e.g. "minio.local:9000")
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Use plain http instead of https
    pub insecure: bool,
}

impl StoreConfig {
    /// Endpoint as a full URL
    ///
    /// # Returns
    /// The endpoint unchanged if it already has a scheme, otherwise
    /// prefixed with `http://` or `https://` depending on `insecure`
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.contains("://") {
            return self.endpoint.clone();
        }
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}", scheme, self.endpoint)
    }
}

/// Daemon mode configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Re-run the sync on a fixed interval instead of exiting
    pub enabled: bool,
    /// Interval in seconds (default: 86400 = 24h)
    pub interval_seconds: u64,
}

impl DaemonConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    /// Logging settings from flags alone, for use before the full
    /// configuration is available
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            level: args.log_level.clone().unwrap_or_else(|| "info".to_string()),
            format: args.log_format.clone().unwrap_or_else(|| "pretty".to_string()),
        }
    }
}

/// Metrics export configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Write Prometheus text format here after every run
    pub textfile: Option<PathBuf>,
}

/// Command-line flags
///
/// Every flag can also be set through its `TODOISTBACKUP_*`
/// environment variable. Flags override the config file.
#[derive(Parser, Debug, Default)]
#[command(name = "todoistbackup", version, about, long_about = None)]
pub struct CliArgs {
    /// Configuration file (JSON or TOML)
    #[arg(long = "config.file", env = "TODOISTBACKUP_CONFIG_FILE", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Todoist API integration token
    #[arg(long = "client.token", env = "TODOISTBACKUP_CLIENT_TOKEN", hide_env_values = true)]
    pub client_token: Option<String>,

    /// Todoist request timeout in seconds
    #[arg(long = "client.timeout", env = "TODOISTBACKUP_CLIENT_TIMEOUT")]
    pub client_timeout: Option<u32>,

    /// Todoist API base URL
    #[arg(long = "client.base-url", env = "TODOISTBACKUP_CLIENT_BASE_URL")]
    pub client_base_url: Option<String>,

    /// S3 bucket name
    #[arg(long = "store.bucket", env = "TODOISTBACKUP_STORE_BUCKET")]
    pub store_bucket: Option<String>,

    /// S3 endpoint address
    #[arg(long = "store.endpoint", env = "TODOISTBACKUP_STORE_ENDPOINT")]
    pub store_endpoint: Option<String>,

    /// S3 region
    #[arg(long = "store.region", env = "TODOISTBACKUP_STORE_REGION")]
    pub store_region: Option<String>,

    /// S3 access key
    #[arg(long = "store.access-key", env = "TODOISTBACKUP_STORE_ACCESS_KEY", hide_env_values = true)]
    pub store_access_key: Option<String>,

    /// S3 secret key
    #[arg(long = "store.secret-key", env = "TODOISTBACKUP_STORE_SECRET_KEY", hide_env_values = true)]
    pub store_secret_key: Option<String>,

    /// Connect to the S3 endpoint over plain http
    #[arg(
        long = "store.insecure",
        env = "TODOISTBACKUP_STORE_INSECURE",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub store_insecure: Option<bool>,

    /// Run the backup job every interval instead of once
    #[arg(
        long = "daemon",
        env = "TODOISTBACKUP_DAEMON",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub daemon: Option<bool>,

    /// Daemon interval in seconds
    #[arg(long = "daemon.interval", env = "TODOISTBACKUP_DAEMON_INTERVAL")]
    pub daemon_interval: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log.level", env = "TODOISTBACKUP_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long = "log.format", env = "TODOISTBACKUP_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Prometheus textfile written after every run
    #[arg(long = "metrics.textfile", env = "TODOISTBACKUP_METRICS_TEXTFILE")]
    pub metrics_textfile: Option<PathBuf>,
}

/// Apply default values to a configuration builder
fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("client.token", "")?
        .set_default("client.timeout", 5)?
        .set_default("client.base_url", DEFAULT_BASE_URL)?
        .set_default("store.bucket", "")?
        .set_default("store.endpoint", "")?
        .set_default("store.region", "us-east-1")?
        .set_default("store.access_key", "")?
        .set_default("store.secret_key", "")?
        .set_default("store.insecure", false)?
        .set_default("daemon.enabled", false)?
        .set_default("daemon.interval_seconds", 86400)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "pretty")
}

/// Apply command-line flags on top of every other source
fn with_overrides(
    builder: ConfigBuilder<DefaultState>,
    args: &CliArgs,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_override_option("client.token", args.client_token.clone())?
        .set_override_option("client.timeout", args.client_timeout.map(i64::from))?
        .set_override_option("client.base_url", args.client_base_url.clone())?
        .set_override_option("store.bucket", args.store_bucket.clone())?
        .set_override_option("store.endpoint", args.store_endpoint.clone())?
        .set_override_option("store.region", args.store_region.clone())?
        .set_override_option("store.access_key", args.store_access_key.clone())?
        .set_override_option("store.secret_key", args.store_secret_key.clone())?
        .set_override_option("store.insecure", args.store_insecure)?
        .set_override_option("daemon.enabled", args.daemon)?
        .set_override_option("daemon.interval_seconds", args.daemon_interval.map(i64::from))?
        .set_override_option("logging.level", args.log_level.clone())?
        .set_override_option("logging.format", args.log_format.clone())?
        .set_override_option(
            "metrics.textfile",
            args.metrics_textfile
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )
}

impl AppConfig {
    /// Load configuration from defaults, file and flags
    ///
    /// An explicitly given config file must exist; the default
    /// `config.json` is optional.
    ///
    /// # Errors
    /// Returns `AppError::Config` if a source cannot be read or the
    /// result is invalid
    pub fn load(args: &CliArgs) -> Result<Self, AppError> {
        let file = match &args.config_file {
            Some(path) => File::from(path.clone()).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let builder = with_defaults(Config::builder())?.add_source(file);
        let config = with_overrides(builder, args)?
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("client.token", &self.client.token),
            ("store.bucket", &self.store.bucket),
            ("store.endpoint", &self.store.endpoint),
            ("store.access_key", &self.store.access_key),
            ("store.secret_key", &self.store.secret_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("{} is required", name)));
            }
        }

        if self.client.timeout == 0 {
            return Err(AppError::Config(
                "client.timeout must be greater than 0".to_string(),
            ));
        }

        if self.daemon.interval_seconds == 0 {
            return Err(AppError::Config(
                "daemon.interval_seconds must be greater than 0".to_string(),
            ));
        }

        url::Url::parse(&self.client.base_url).map_err(|e| {
            AppError::Config(format!("client.base_url is not a valid URL: {}", e))
        })?;

        Ok(())
    }
}
