//! Storage module
//!
//! Pluggable object store with a local filesystem backend and an
//! S3-compatible backend (MinIO, Cloudflare R2, Backblaze B2, AWS S3).

mod local;
mod s3_client;
mod traits;
mod types;

use std::sync::Arc;

pub use local::LocalObjectStore;
pub use s3_client::S3Client;
pub use traits::ObjectStore;
pub use types::*;

use crate::config::{StorageConfig, StorageProvider};
use crate::error::StorageResult;

/// Key of a persisted object, sharded by the first two hex chars of its digest
pub fn content_key(digest: &str) -> String {
    let (shard, _) = digest.split_at(2.min(digest.len()));
    format!("objects/{}/{}", shard, digest)
}

/// Build the configured backend
pub async fn connect(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.provider {
        StorageProvider::Local => Arc::new(LocalObjectStore::new(&config.root).await?),
        StorageProvider::S3 => Arc::new(S3Client::new(config).await?),
    };

    tracing::info!(backend = store.name(), "Object store ready");
    Ok(store)
}
