//! Todoist export API client
//!
//! `GET {base}/backups/get` lists archives; each archive URL is then
//! fetched directly with the same bearer token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use url::Url;

use super::BackupSource;
use crate::config::ClientConfig;
use crate::data::{BackupDescriptor, BackupDownload, BackupMetadata};
use crate::error::AppError;

/// User-Agent sent with every request
pub const USER_AGENT: &str = concat!("todoistbackup/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the Todoist sync API
#[derive(Clone)]
pub struct TodoistClient {
    http_client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl TodoistClient {
    /// Create new API client
    ///
    /// # Arguments
    /// * `config` - Token, timeout and base URL
    ///
    /// # Errors
    /// Returns error if the base URL is invalid or the HTTP client
    /// cannot be built
    pub fn new(config: &ClientConfig) -> Result<Self, AppError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| AppError::Config(format!("invalid client.base_url: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            token: config.token.clone(),
        })
    }

    fn backups_url(&self) -> String {
        format!("{}/backups/get", self.base_url.as_str().trim_end_matches('/'))
    }

    /// Authenticated GET, rejecting non 2xx/3xx responses
    async fn get(&self, url: &str) -> Result<reqwest::Response, AppError> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        check_response(response)
    }
}

#[async_trait]
impl BackupSource for TodoistClient {
    async fn list_backups(&self) -> Result<Vec<BackupDescriptor>, AppError> {
        let url = self.backups_url();
        tracing::debug!(url = %url, "Listing Todoist backups");

        let backups = self.get(&url).await?.json::<Vec<BackupDescriptor>>().await?;
        Ok(backups)
    }

    async fn download(&self, backup: &BackupDescriptor) -> Result<BackupDownload, AppError> {
        let response = self.get(&backup.url).await?;

        let metadata = match parse_metadata(response.headers(), response.content_length()) {
            Ok(metadata) => Some(metadata),
            Err(error) => {
                tracing::warn!(version = %backup.version, %error, "Failed to parse backup metadata");
                None
            }
        };

        let body = response.bytes_stream().map_err(AppError::from).boxed();
        Ok(BackupDownload::new(metadata, body))
    }
}

fn check_response(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(response);
    }

    Err(AppError::UnexpectedStatus {
        status,
        url: response.url().to_string(),
    })
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

/// Extract archive metadata from download response headers
///
/// # Errors
/// Fails when `Last-Modified` is missing or not an HTTP date
pub fn parse_metadata(
    headers: &HeaderMap,
    content_length: Option<u64>,
) -> Result<BackupMetadata, AppError> {
    let raw_last_modified = header_string(headers, LAST_MODIFIED).ok_or_else(|| {
        AppError::Internal(anyhow::anyhow!("parsing header Last-Modified: missing"))
    })?;
    let last_modified = DateTime::parse_from_rfc2822(&raw_last_modified)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("parsing header Last-Modified: {}", e)))?
        .with_timezone(&Utc);

    Ok(BackupMetadata {
        content_disposition: header_string(headers, CONTENT_DISPOSITION),
        content_type: header_string(headers, CONTENT_TYPE),
        etag: header_string(headers, ETAG),
        last_modified,
        size: content_length,
    })
}
