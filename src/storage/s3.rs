//! Backup storage on S3-compatible object stores
//!
//! Works against AWS S3, MinIO, R2 and friends. Archives are streamed
//! through a fixed-size part buffer and never held in memory whole.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use super::keys::{KEY_PREFIX, VERSION_METADATA_KEY, collect_versions, key_from_version};
use super::{BackupStore, build_s3_http_client};
use crate::config::StoreConfig;
use crate::data::{BackupBody, BackupDescriptor, BackupDownload, BackupMetadata, VersionSet};
use crate::error::AppError;

/// Multipart part size (S3 requires at least 5 MiB for all but the last part)
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// Concurrent HEAD requests while enumerating versions
const HEAD_CONCURRENCY: usize = 8;

/// Region that must not be sent as a location constraint
const DEFAULT_REGION: &str = "us-east-1";

fn storage_error<E>(context: &str, error: E) -> AppError
where
    E: std::error::Error,
{
    AppError::Storage(format!("{}: {}", context, DisplayErrorContext(error)))
}

/// User metadata attached to every stored archive
fn object_metadata(
    backup: &BackupDescriptor,
    metadata: Option<&BackupMetadata>,
) -> HashMap<String, String> {
    let mut tags = HashMap::from([(VERSION_METADATA_KEY.to_string(), backup.version.clone())]);

    if let Some(metadata) = metadata {
        if let Some(etag) = &metadata.etag {
            tags.insert("source-etag".to_string(), etag.clone());
        }
        tags.insert(
            "source-last-modified".to_string(),
            metadata.last_modified.to_rfc3339(),
        );
    }

    tags
}

/// Open multipart upload and the parts written so far
struct MultipartUpload {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

/// Backup store backed by one S3 bucket
pub struct S3BackupStore {
    /// S3-compatible client
    client: S3Client,
    /// Bucket holding the archives
    bucket: String,
}

impl S3BackupStore {
    /// Create new store client
    ///
    /// Does not touch the network; see [`S3BackupStore::connect`].
    pub fn new(config: &StoreConfig) -> Self {
        use aws_sdk_s3::config::BehaviorVersion;
        use aws_sdk_s3::config::{Credentials, Region};

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "todoistbackup-s3",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .http_client(build_s3_http_client())
            .region(Region::new(config.region.clone()))
            .endpoint_url(config.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }

    /// Create store client and make sure the bucket exists
    ///
    /// # Errors
    /// Returns error if the bucket can neither be found nor created
    pub async fn connect(config: &StoreConfig) -> Result<Self, AppError> {
        let store = Self::new(config);
        store.ensure_bucket(&config.region).await?;
        Ok(store)
    }

    async fn ensure_bucket(&self, region: &str) -> Result<(), AppError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(SdkError::ServiceError(service_err)) if service_err.raw().status().as_u16() == 404 => {}
            Err(e) => return Err(storage_error("Failed to check bucket", e)),
        }

        tracing::info!(bucket = %self.bucket, "Creating bucket");

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        request
            .send()
            .await
            .map_err(|e| storage_error("Failed to create bucket", e))?;

        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, AppError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(KEY_PREFIX);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| storage_error("Failed to list backups", e))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_owned)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    /// User metadata of one object
    ///
    /// `None` when the object vanished after it was listed.
    async fn object_user_metadata(
        &self,
        key: String,
    ) -> Result<Option<(String, Option<HashMap<String, String>>)>, AppError> {
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(response) => {
                let metadata = response.metadata().cloned();
                Ok(Some((key, metadata)))
            }
            Err(SdkError::ServiceError(service_err)) if service_err.raw().status().as_u16() == 404 => {
                tracing::warn!(key = %key, "Listed backup object is gone, skipping");
                Ok(None)
            }
            Err(e) => Err(storage_error(&format!("Failed to read metadata of {}", key), e)),
        }
    }

    /// Single PUT for archives shorter than one part
    async fn put_single(
        &self,
        key: &str,
        tags: HashMap<String, String>,
        metadata: Option<&BackupMetadata>,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let length = data.len() as i64;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(length)
            .set_content_type(metadata.and_then(|m| m.content_type.clone()))
            .set_content_disposition(metadata.and_then(|m| m.content_disposition.clone()))
            .set_metadata(Some(tags))
            .body(ByteStream::from(data))
            .send();

        // A single PUT leaves nothing behind when dropped
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AppError::Cancelled),
            result = request => result
                .map(|_| ())
                .map_err(|e| storage_error("Backup upload failed", e)),
        }
    }

    async fn create_multipart(
        &self,
        key: &str,
        tags: HashMap<String, String>,
        metadata: Option<&BackupMetadata>,
    ) -> Result<MultipartUpload, AppError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_content_type(metadata.and_then(|m| m.content_type.clone()))
            .set_content_disposition(metadata.and_then(|m| m.content_disposition.clone()))
            .set_metadata(Some(tags))
            .send()
            .await
            .map_err(|e| storage_error("Failed to start multipart upload", e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| AppError::Storage("multipart upload without upload id".to_string()))?
            .to_string();

        Ok(MultipartUpload {
            upload_id,
            parts: Vec::new(),
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload: &mut MultipartUpload,
        data: Bytes,
    ) -> Result<(), AppError> {
        let part_number = upload.parts.len() as i32 + 1;

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .part_number(part_number)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| storage_error("Failed to upload part", e))?;

        upload.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(response.e_tag().map(str::to_owned))
                .build(),
        );

        Ok(())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload: &mut MultipartUpload,
        remaining: Bytes,
    ) -> Result<(), AppError> {
        if !remaining.is_empty() {
            self.upload_part(key, upload, remaining).await?;
        }

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(upload.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| storage_error("Failed to complete multipart upload", e))?;

        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload: &MultipartUpload) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload.upload_id)
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(key = %key, error = %DisplayErrorContext(e), "Failed to abort multipart upload");
        }
    }

    /// Drain the body, uploading every full part
    ///
    /// Stops with `AppError::Cancelled` as soon as `cancel` fires while
    /// waiting on the body or on a part upload. Whatever was started is
    /// left in `multipart` for the caller to abort.
    ///
    /// # Returns
    /// The unsent tail of the body and the total byte count
    async fn upload_full_parts(
        &self,
        key: &str,
        tags: &HashMap<String, String>,
        metadata: Option<&BackupMetadata>,
        mut body: BackupBody,
        multipart: &mut Option<MultipartUpload>,
        cancel: &CancellationToken,
    ) -> Result<(BytesMut, u64), AppError> {
        let mut buffer = BytesMut::new();
        let mut written: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                next = body.next() => next,
            };
            let Some(chunk) = next else { break };

            let chunk = chunk?;
            written += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= PART_SIZE {
                let part = buffer.split_to(PART_SIZE).freeze();
                let upload = match multipart.take() {
                    Some(upload) => upload,
                    None => self.create_multipart(key, tags.clone(), metadata).await?,
                };
                let upload = multipart.insert(upload);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    result = self.upload_part(key, upload, part) => result?,
                }
            }
        }

        Ok((buffer, written))
    }
}

#[async_trait]
impl BackupStore for S3BackupStore {
    async fn list_versions(&self) -> Result<VersionSet, AppError> {
        let keys = self.list_keys().await?;

        let objects: Vec<_> = futures::stream::iter(keys)
            .map(|key| self.object_user_metadata(key))
            .buffer_unordered(HEAD_CONCURRENCY)
            .try_collect()
            .await?;

        Ok(collect_versions(objects.into_iter().flatten()))
    }

    async fn put_backup(
        &self,
        backup: &BackupDescriptor,
        download: BackupDownload,
        cancel: &CancellationToken,
    ) -> Result<u64, AppError> {
        let key = key_from_version(&backup.version);
        let BackupDownload { metadata, body } = download;
        let tags = object_metadata(backup, metadata.as_ref());

        let mut multipart = None;
        let outcome = self
            .upload_full_parts(&key, &tags, metadata.as_ref(), body, &mut multipart, cancel)
            .await;

        let written = match multipart {
            None => {
                let (remaining, written) = outcome?;
                self.put_single(&key, tags, metadata.as_ref(), remaining.freeze(), cancel)
                    .await?;
                written
            }
            Some(mut upload) => {
                let finished = match outcome {
                    Ok(_) if cancel.is_cancelled() => Err(AppError::Cancelled),
                    Ok((remaining, written)) => self
                        .complete_multipart(&key, &mut upload, remaining.freeze())
                        .await
                        .map(|()| written),
                    Err(error) => Err(error),
                };

                match finished {
                    Ok(written) => written,
                    Err(error) => {
                        self.abort_multipart(&key, &upload).await;
                        return Err(error);
                    }
                }
            }
        };

        tracing::debug!(key = %key, bytes = written, "Stored backup object");
        Ok(written)
    }
}
