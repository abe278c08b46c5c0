//! Common test utilities for E2E tests
//!
//! `FakeTodoist` serves the two export API endpoints on an ephemeral
//! port; `FakeS3` answers the S3 calls `S3BackupStore` makes;
//! `MemoryStore` is a `BackupStore` kept in a map.

#![allow(dead_code)]

mod fake_s3;

pub use fake_s3::{FakeS3, S3Object};

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use todoist_backup::config::ClientConfig;
use todoist_backup::data::{BackupDescriptor, BackupDownload, VersionSet};
use todoist_backup::error::AppError;
use todoist_backup::remote::TodoistClient;
use todoist_backup::storage::{BackupStore, VERSION_METADATA_KEY, collect_versions, key_from_version};

pub const TEST_TOKEN: &str = "test-token";
pub const LAST_MODIFIED: &str = "Mon, 01 Jan 2024 10:30:00 GMT";

// =============================================================================
// Fake Todoist API
// =============================================================================

/// One archive served by the fake API
#[derive(Debug, Clone)]
pub struct FakeBackup {
    pub version: String,
    /// Path segment of the download URL
    pub name: String,
    pub payload: Vec<u8>,
    pub status: StatusCode,
    pub last_modified: Option<String>,
}

impl FakeBackup {
    pub fn new(name: &str, version: &str, payload: &[u8]) -> Self {
        Self {
            version: version.to_string(),
            name: name.to_string(),
            payload: payload.to_vec(),
            status: StatusCode::OK,
            last_modified: Some(LAST_MODIFIED.to_string()),
        }
    }

    /// A backup whose download always answers with `status`
    pub fn failing(name: &str, version: &str, status: StatusCode) -> Self {
        Self {
            status,
            ..Self::new(name, version, b"")
        }
    }

    pub fn without_last_modified(mut self) -> Self {
        self.last_modified = None;
        self
    }
}

#[derive(Clone)]
struct FakeState {
    base: String,
    backups: Arc<Mutex<Vec<FakeBackup>>>,
    downloads: Arc<AtomicUsize>,
}

/// Fake Todoist export API server
pub struct FakeTodoist {
    pub addr: String,
    state: FakeState,
}

impl FakeTodoist {
    /// Start serving `backups` on a random local port
    pub async fn start(backups: Vec<FakeBackup>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());

        let state = FakeState {
            base: addr.clone(),
            backups: Arc::new(Mutex::new(backups)),
            downloads: Arc::new(AtomicUsize::new(0)),
        };

        let app = Router::new()
            .route("/sync/v9/backups/get", get(list_backups))
            .route("/download/:name", get(download_backup))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// API base URL to configure the client with
    pub fn base_url(&self) -> String {
        format!("{}/sync/v9", self.addr)
    }

    /// Client authenticated with the expected token
    pub fn client(&self) -> TodoistClient {
        self.client_with_token(TEST_TOKEN)
    }

    pub fn client_with_token(&self, token: &str) -> TodoistClient {
        TodoistClient::new(&ClientConfig {
            token: token.to_string(),
            timeout: 5,
            base_url: self.base_url(),
        })
        .unwrap()
    }

    /// Number of download requests served so far
    pub fn downloads(&self) -> usize {
        self.state.downloads.load(Ordering::SeqCst)
    }

    pub fn push(&self, backup: FakeBackup) {
        self.state.backups.lock().unwrap().push(backup);
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {}", TEST_TOKEN))
}

async fn list_backups(State(state): State<FakeState>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "Forbidden").into_response();
    }

    let listing: Vec<serde_json::Value> = state
        .backups
        .lock()
        .unwrap()
        .iter()
        .map(|backup| {
            serde_json::json!({
                "url": format!("{}/download/{}", state.base, backup.name),
                "version": backup.version,
            })
        })
        .collect();

    axum::Json(listing).into_response()
}

async fn download_backup(
    State(state): State<FakeState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "Forbidden").into_response();
    }

    state.downloads.fetch_add(1, Ordering::SeqCst);

    let backup = state
        .backups
        .lock()
        .unwrap()
        .iter()
        .find(|backup| backup.name == name)
        .cloned();

    let Some(backup) = backup else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if backup.status != StatusCode::OK {
        return (backup.status, "boom").into_response();
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, "application/zip".parse().unwrap());
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}.zip\"", backup.name)
            .parse()
            .unwrap(),
    );
    response_headers.insert(header::ETAG, format!("\"{}\"", backup.name).parse().unwrap());
    if let Some(last_modified) = &backup.last_modified {
        response_headers.insert(header::LAST_MODIFIED, last_modified.parse().unwrap());
    }

    (StatusCode::OK, response_headers, backup.payload).into_response()
}

// =============================================================================
// In-memory backup store
// =============================================================================

/// Object stored in `MemoryStore`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

/// `BackupStore` kept in a map of key -> object
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
    puts: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, bypassing `put_backup`
    pub fn insert_raw(&self, key: &str, data: &[u8], metadata: HashMap<String, String>) {
        self.objects.lock().unwrap().insert(key.to_string(), StoredObject {
            data: data.to_vec(),
            metadata,
        });
    }

    /// Store a backup the way a previous run would have
    pub fn seed_version(&self, version: &str) {
        self.insert_raw(
            &key_from_version(version),
            b"seeded",
            HashMap::from([(VERSION_METADATA_KEY.to_string(), version.to_string())]),
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Number of `put_backup` calls
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn list_versions(&self) -> Result<VersionSet, AppError> {
        let objects: Vec<_> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .map(|(key, object)| (key.clone(), Some(object.metadata.clone())))
            .collect();

        Ok(collect_versions(objects))
    }

    async fn put_backup(
        &self,
        backup: &BackupDescriptor,
        download: BackupDownload,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError> {
        self.puts.fetch_add(1, Ordering::SeqCst);

        let mut body = download.body;
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            data.extend_from_slice(&chunk?);
        }

        let written = data.len() as u64;
        self.insert_raw(
            &key_from_version(&backup.version),
            &data,
            HashMap::from([(VERSION_METADATA_KEY.to_string(), backup.version.clone())]),
        );
        Ok(written)
    }
}
