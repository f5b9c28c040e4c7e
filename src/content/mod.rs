//! Range Content Server
//!
//! Serves persisted objects by digest, whole or as a single byte range.
//! Objects are immutable, so their metadata is cached and reads take no locks.

mod range;

use std::sync::Arc;

use crate::cache::TtlCache;
use crate::clock::SharedClock;
use crate::error::StorageError;
use crate::storage::{content_key, ByteStream, ObjectStore};

pub use range::{parse_range_header, ByteRange};

/// `Cache-Control` for immutable content
pub const IMMUTABLE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

/// Content server errors
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Invalid content key: {0}")]
    InvalidKey(String),

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for ContentError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound(key) => ContentError::NotFound(key),
            StorageError::InvalidKey(key) => ContentError::InvalidKey(key),
            other => ContentError::Storage(other),
        }
    }
}

impl ContentError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RangeNotSatisfiable { .. } => "RANGE_NOT_SATISFIABLE",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// Metadata of a persisted object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedObject {
    /// SHA-256 of the object, lowercase hex
    pub digest: String,
    pub storage_key: String,
    pub size: u64,
}

impl ResolvedObject {
    /// Strong ETag derived from the digest
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.digest)
    }

    /// Whether an `If-None-Match` header value matches this object
    pub fn matches_etag(&self, if_none_match: &str) -> bool {
        let etag = self.etag();
        if_none_match.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.trim_start_matches("W/") == etag
        })
    }
}

/// An opened object ready to stream
pub struct ContentBody {
    pub object: ResolvedObject,
    /// `None` for a full read
    pub range: Option<ByteRange>,
    pub stream: ByteStream,
}

impl ContentBody {
    /// Number of bytes the stream yields
    pub fn content_length(&self) -> u64 {
        self.range.map(|r| r.len()).unwrap_or(self.object.size)
    }
}

/// Serves content-addressed objects
#[derive(Clone)]
pub struct ContentServer {
    store: Arc<dyn ObjectStore>,
    metadata: TtlCache<String, ResolvedObject>,
}

impl ContentServer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: SharedClock,
        cache_ttl: chrono::Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            metadata: TtlCache::in_memory(cache_capacity, clock, cache_ttl),
        }
    }

    /// Validate a content key, returning the normalized digest
    pub fn parse_key(key: &str) -> Result<String, ContentError> {
        let digest = key.trim().to_ascii_lowercase();
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ContentError::InvalidKey(key.to_string()));
        }
        Ok(digest)
    }

    /// Size and ETag of an object
    pub async fn resolve(&self, key: &str) -> Result<ResolvedObject, ContentError> {
        let digest = Self::parse_key(key)?;

        if let Some(object) = self.metadata.get(&digest) {
            return Ok(object);
        }

        let storage_key = content_key(&digest);
        let meta = self.store.head(&storage_key).await.map_err(|e| match e {
            StorageError::ObjectNotFound(_) => ContentError::NotFound(digest.clone()),
            other => ContentError::from(other),
        })?;

        let object = ResolvedObject {
            digest: digest.clone(),
            storage_key,
            size: meta.size,
        };

        tracing::debug!(digest = %digest, size = object.size, "Resolved object metadata");
        self.metadata.set(digest, object.clone());
        Ok(object)
    }

    /// Open an object for streaming, optionally restricted by a `Range` header
    pub async fn open(&self, key: &str, range_header: Option<&str>) -> Result<ContentBody, ContentError> {
        let object = self.resolve(key).await?;

        let range = range_header
            .map(|header| parse_range_header(header, object.size))
            .transpose()
            .map_err(|e| {
                tracing::warn!(digest = %object.digest, range = ?range_header, "Invalid range header");
                e
            })?;

        let (offset, len) = match range {
            Some(range) => (range.start, range.len()),
            None => (0, object.size),
        };

        let stream = self
            .store
            .get_range_stream(&object.storage_key, offset, len)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    self.metadata.invalidate(&object.digest);
                }
                ContentError::from(e)
            })?;

        tracing::debug!(
            digest = %object.digest,
            offset = offset,
            size = len,
            "Serving content"
        );

        Ok(ContentBody {
            object,
            range,
            stream,
        })
    }
}
