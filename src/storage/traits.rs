//! Object store interface
//!
//! Both the chunk staging area and the final content-addressed objects live
//! behind [`ObjectStore`], so a local filesystem and an S3-compatible bucket
//! satisfy the same contracts.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

use super::types::{ByteStream, ObjectMetadata};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn head(&self, key: &str) -> StorageResult<ObjectMetadata>;

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Stream `len` bytes starting at `offset`
    async fn get_range_stream(&self, key: &str, offset: u64, len: u64) -> StorageResult<ByteStream>;

    /// Write an object. Readers observe either the previous state or the
    /// complete new object, never a partial write.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Write only if the key is absent. Returns `true` when written.
    ///
    /// Only safe for content-addressed keys: concurrent writers of the same
    /// key carry identical bytes.
    async fn put_if_absent(&self, key: &str, data: Bytes) -> StorageResult<bool> {
        if self.exists(key).await? {
            return Ok(false);
        }
        self.put(key, data).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Keys of every object under `prefix`, in no particular order
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Delete every object under `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize>;
}
