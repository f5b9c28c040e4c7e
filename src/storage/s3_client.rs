//! S3-compatible object store
//!
//! Wraps the AWS SDK for S3-compatible storage access (MinIO, R2, B2, AWS).
//! Single PUTs are atomic on S3, so no temp-and-rename step is needed.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::{DisplayErrorContext, SdkError},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream as S3ByteStream,
    Client,
};
use bytes::Bytes;
use chrono::DateTime;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};

use super::traits::ObjectStore;
use super::types::{ByteStream, ObjectMetadata};

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Client {
    /// Create a new S3 client from configuration
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "bookvault",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        let client = Client::from_conf(s3_config);

        let bucket = config.bucket.clone();
        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %bucket, "Connected to S3 bucket");
            }
            Err(e) => {
                tracing::warn!(
                    bucket = %bucket,
                    error = %e,
                    "Could not verify bucket, will attempt operations anyway"
                );
            }
        }

        Ok(Self {
            client,
            bucket,
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    /// Strip the configured prefix from a bucket key
    fn relative_key<'a>(&self, full_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return full_key;
        }
        full_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(full_key)
    }

    /// Map an SDK failure, using the operation's typed error to spot missing keys
    fn map_error<E, R>(
        err: SdkError<E, R>,
        op: &str,
        key: &str,
        is_missing: fn(&E) -> bool,
    ) -> StorageError
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        if err.as_service_error().map(is_missing).unwrap_or(false) {
            return StorageError::ObjectNotFound(key.to_string());
        }
        StorageError::SdkError(format!(
            "Failed to {} {}: {}",
            op,
            key,
            DisplayErrorContext(&err)
        ))
    }

    /// List every key under a prefix (handles pagination)
    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let full_prefix = self.full_key(prefix);
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .max_keys(1000);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Self::map_error(e, "list", prefix, |_| false))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            if !response.is_truncated().unwrap_or(false) {
                break;
            }
            continuation_token = response.next_continuation_token().map(|s| s.to_string());
        }

        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_error(e, "head object", key, HeadObjectError::is_not_found))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            content_type: response.content_type().map(|s| s.to_string()),
            etag: response.e_tag().map(|s| s.to_string()),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_error(e, "get object", key, GetObjectError::is_no_such_key))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::SdkError(format!("Failed to read object body: {}", e)))?
            .into_bytes();

        Ok(data)
    }

    async fn get_range_stream(&self, key: &str, offset: u64, len: u64) -> StorageResult<ByteStream> {
        if len == 0 {
            return Ok(Box::pin(futures::stream::empty::<Result<Bytes, StorageError>>()));
        }

        // S3 ranges are inclusive on both ends
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .range(range)
            .send()
            .await
            .map_err(|e| Self::map_error(e, "get object range", key, GetObjectError::is_no_such_key))?;

        let reader = ReaderStream::new(response.body.into_async_read());
        Ok(Box::pin(reader.map(|chunk| chunk.map_err(StorageError::Io))))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type("application/octet-stream")
            .body(S3ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::map_error(e, "put object", key, |_| false))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| Self::map_error(e, "delete object", key, |_| false))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let keys = self.list_keys(prefix).await?;
        Ok(keys
            .iter()
            .map(|full_key| self.relative_key(full_key).to_string())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let keys = self.list_keys(prefix).await?;
        let count = keys.len();

        for full_key in keys {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&full_key)
                .send()
                .await
                .map_err(|e| Self::map_error(e, "delete object", &full_key, |_| false))?;
        }

        Ok(count)
    }
}
