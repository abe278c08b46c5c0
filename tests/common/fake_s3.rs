//! In-process S3 endpoint for `S3BackupStore`
//!
//! Path-style addressing only. Every served call is recorded by its
//! S3 operation name so tests can assert on the exact sequence.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use todoist_backup::config::StoreConfig;
use todoist_backup::storage::S3BackupStore;

pub const TEST_BUCKET: &str = "test-backups";

const META_PREFIX: &str = "x-amz-meta-";
const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const XML_NS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

/// Object held by `FakeS3`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Object {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

struct PendingUpload {
    key: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, Vec<u8>>,
}

struct S3State {
    bucket_exists: bool,
    objects: BTreeMap<String, S3Object>,
    /// Keys that show up in listings but answer HEAD with 404
    vanished: Vec<String>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: usize,
    page_size: usize,
    calls: Vec<String>,
}

type SharedState = Arc<Mutex<S3State>>;

/// Fake S3 server
#[derive(Clone)]
pub struct FakeS3 {
    /// `host:port` the server listens on
    pub addr: String,
    state: SharedState,
}

impl FakeS3 {
    /// Start serving an existing, empty bucket
    pub async fn start() -> Self {
        Self::start_with(true).await
    }

    /// Start serving without the test bucket
    pub async fn start_without_bucket() -> Self {
        Self::start_with(false).await
    }

    async fn start_with(bucket_exists: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let state = Arc::new(Mutex::new(S3State {
            bucket_exists,
            objects: BTreeMap::new(),
            vanished: Vec::new(),
            uploads: HashMap::new(),
            next_upload: 1,
            page_size: 1000,
            calls: Vec::new(),
        }));

        let app = Router::new()
            .route("/*path", any(handle))
            .layer(DefaultBodyLimit::disable())
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Store configuration pointing at this server
    pub fn config(&self) -> StoreConfig {
        StoreConfig {
            bucket: TEST_BUCKET.to_string(),
            endpoint: self.addr.clone(),
            region: "us-east-1".to_string(),
            access_key: "test-key".to_string(),
            secret_key: "test-secret".to_string(),
            insecure: true,
        }
    }

    pub fn store(&self) -> S3BackupStore {
        S3BackupStore::new(&self.config())
    }

    /// S3 operations served so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|call| *call == operation).count()
    }

    pub fn object(&self, key: &str) -> Option<S3Object> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn insert_object(&self, key: &str, data: &[u8], metadata: HashMap<String, String>) {
        self.state.lock().unwrap().objects.insert(key.to_string(), S3Object {
            data: data.to_vec(),
            metadata,
        });
    }

    /// List `key` without serving it, as if it was deleted in between
    pub fn insert_vanished(&self, key: &str) {
        self.state.lock().unwrap().vanished.push(key.to_string());
    }

    /// Maximum keys per listing page
    pub fn set_page_size(&self, page_size: usize) {
        self.state.lock().unwrap().page_size = page_size;
    }
}

async fn handle(
    State(state): State<SharedState>,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: axum::http::Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();

    let (bucket, key) = match path.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (bucket, Some(key)),
        Some((bucket, _)) => (bucket, None),
        None => (path.as_str(), None),
    };
    if bucket != TEST_BUCKET {
        return StatusCode::NOT_FOUND.into_response();
    }

    match (method.as_str(), key) {
        ("HEAD", None) => {
            state.calls.push("HeadBucket".to_string());
            if state.bucket_exists {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
        ("PUT", None) => {
            state.calls.push("CreateBucket".to_string());
            state.bucket_exists = true;
            StatusCode::OK.into_response()
        }
        ("GET", None) => {
            state.calls.push("ListObjectsV2".to_string());
            list_objects(&state, &query)
        }
        ("HEAD", Some(key)) => {
            state.calls.push("HeadObject".to_string());
            match state.objects.get(key) {
                Some(object) => (StatusCode::OK, metadata_headers(&object.metadata)).into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        ("PUT", Some(key)) if query.contains_key("uploadId") => {
            state.calls.push("UploadPart".to_string());
            let part_number: u32 = query
                .get("partNumber")
                .and_then(|n| n.parse().ok())
                .unwrap_or_default();
            match state.uploads.get_mut(&query["uploadId"]) {
                Some(upload) if upload.key == key => {
                    upload.parts.insert(part_number, body.to_vec());
                    etag_response(&format!("part-{}", part_number))
                }
                _ => StatusCode::NOT_FOUND.into_response(),
            }
        }
        ("PUT", Some(key)) => {
            state.calls.push("PutObject".to_string());
            state.objects.insert(key.to_string(), S3Object {
                data: body.to_vec(),
                metadata: request_metadata(&headers),
            });
            etag_response("object")
        }
        ("POST", Some(key)) if query.contains_key("uploads") => {
            state.calls.push("CreateMultipartUpload".to_string());
            let upload_id = format!("u{}", state.next_upload);
            state.next_upload += 1;
            state.uploads.insert(upload_id.clone(), PendingUpload {
                key: key.to_string(),
                metadata: request_metadata(&headers),
                parts: BTreeMap::new(),
            });
            xml_response(format!(
                "{XML_HEADER}<InitiateMultipartUploadResult xmlns=\"{XML_NS}\">\
                 <Bucket>{TEST_BUCKET}</Bucket><Key>{key}</Key><UploadId>{upload_id}</UploadId>\
                 </InitiateMultipartUploadResult>"
            ))
        }
        ("POST", Some(key)) if query.contains_key("uploadId") => {
            state.calls.push("CompleteMultipartUpload".to_string());
            let Some(upload) = state.uploads.remove(&query["uploadId"]) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let data = upload.parts.into_values().flatten().collect();
            state.objects.insert(key.to_string(), S3Object {
                data,
                metadata: upload.metadata,
            });
            xml_response(format!(
                "{XML_HEADER}<CompleteMultipartUploadResult xmlns=\"{XML_NS}\">\
                 <Bucket>{TEST_BUCKET}</Bucket><Key>{key}</Key><ETag>\"complete\"</ETag>\
                 </CompleteMultipartUploadResult>"
            ))
        }
        ("DELETE", Some(_)) if query.contains_key("uploadId") => {
            state.calls.push("AbortMultipartUpload".to_string());
            state.uploads.remove(&query["uploadId"]);
            StatusCode::NO_CONTENT.into_response()
        }
        (method, _) => {
            state.calls.push(format!("Unsupported {}", method));
            StatusCode::NOT_IMPLEMENTED.into_response()
        }
    }
}

fn list_objects(state: &S3State, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").map(String::as_str).unwrap_or("");

    let mut keys: Vec<&str> = state
        .objects
        .keys()
        .chain(state.vanished.iter())
        .map(String::as_str)
        .filter(|key| key.starts_with(prefix))
        .collect();
    keys.sort_unstable();

    let start = query
        .get("continuation-token")
        .and_then(|token| token.parse::<usize>().ok())
        .unwrap_or(0)
        .min(keys.len());
    let end = (start + state.page_size).min(keys.len());
    let truncated = end < keys.len();

    let mut xml = format!(
        "{XML_HEADER}<ListBucketResult xmlns=\"{XML_NS}\">\
         <Name>{TEST_BUCKET}</Name><Prefix>{prefix}</Prefix><KeyCount>{}</KeyCount>\
         <MaxKeys>1000</MaxKeys><IsTruncated>{truncated}</IsTruncated>",
        end - start
    );
    for key in &keys[start..end] {
        xml.push_str(&format!(
            "<Contents><Key>{key}</Key><Size>0</Size><StorageClass>STANDARD</StorageClass></Contents>"
        ));
    }
    if truncated {
        xml.push_str(&format!("<NextContinuationToken>{end}</NextContinuationToken>"));
    }
    xml.push_str("</ListBucketResult>");

    xml_response(xml)
}

fn request_metadata(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let key = name.as_str().strip_prefix(META_PREFIX)?;
            Some((key.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn metadata_headers(metadata: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in metadata {
        let name = format!("{}{}", META_PREFIX, key);
        headers.insert(
            header::HeaderName::try_from(name).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    headers
}

fn etag_response(etag: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::ETAG, HeaderValue::from_str(&format!("\"{}\"", etag)).unwrap());
    (StatusCode::OK, headers).into_response()
}

fn xml_response(xml: String) -> Response {
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], xml).into_response()
}
