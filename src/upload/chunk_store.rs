//! Chunk Store
//!
//! Staging area for uploaded chunks before assembly. Bytes live in the
//! configured object store under `staging/<upload_id>/<part:08>.chunk`;
//! part status is answered from the session manifest, never from the bytes.

use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::storage::ObjectStore;

use super::session::SessionState;
use super::types::{ChunkStatus, UploadError};

/// Staging store with a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Storage backend
    backend: Arc<dyn ObjectStore>,

    /// Largest accepted chunk; also the staging slack per session
    max_chunk_size: u64,
}

impl ChunkStore {
    pub fn new(backend: Arc<dyn ObjectStore>, max_chunk_size: u64) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                backend,
                max_chunk_size,
            }),
        }
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.inner.max_chunk_size
    }

    fn session_prefix(session_id: Uuid) -> String {
        format!("staging/{}/", session_id)
    }

    /// Staging key of a part
    pub fn chunk_key(session_id: Uuid, part_number: u32) -> String {
        format!("staging/{}/{:08}.chunk", session_id, part_number)
    }

    /// Check the staging budget for an incoming chunk.
    ///
    /// `staged` counts bytes already staged or reserved for the session.
    pub fn admit(&self, declared_total: u64, staged: u64, incoming: u64) -> Result<(), UploadError> {
        let max_chunk = self.inner.max_chunk_size;
        if incoming > max_chunk {
            return Err(UploadError::Backpressure {
                attempted: incoming,
                limit: max_chunk,
            });
        }

        let limit = declared_total.saturating_add(max_chunk);
        let attempted = staged.saturating_add(incoming);
        if attempted > limit {
            return Err(UploadError::Backpressure { attempted, limit });
        }

        Ok(())
    }

    /// Durably stage a verified chunk. Replaces any previous bytes for the part.
    pub async fn put(&self, session_id: Uuid, part_number: u32, data: Bytes) -> StorageResult<()> {
        let size = data.len();
        self.inner
            .backend
            .put(&Self::chunk_key(session_id, part_number), data)
            .await?;

        tracing::debug!(
            session_id = %session_id,
            part_number = part_number,
            size = size,
            "Staged chunk"
        );

        Ok(())
    }

    /// Raw bytes of a staged part
    pub async fn read(&self, session_id: Uuid, part_number: u32) -> StorageResult<Bytes> {
        self.inner
            .backend
            .get(&Self::chunk_key(session_id, part_number))
            .await
    }

    /// Status of a part from the session manifest
    pub fn status_of(state: &SessionState, part_number: u32) -> ChunkStatus {
        match state.chunk(part_number) {
            Some(record) => ChunkStatus {
                part_number,
                received: true,
                size: Some(record.byte_size),
                hash: Some(record.content_hash.clone()),
                received_at: Some(record.received_at),
            },
            None => ChunkStatus::not_uploaded(part_number),
        }
    }

    /// Remove a single staged part
    pub async fn discard(&self, session_id: Uuid, part_number: u32) -> StorageResult<()> {
        match self
            .inner
            .backend
            .delete(&Self::chunk_key(session_id, part_number))
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete every staged part of a session, stray temp files included
    pub async fn delete_session(&self, session_id: Uuid) -> StorageResult<usize> {
        let count = self
            .inner
            .backend
            .delete_prefix(&Self::session_prefix(session_id))
            .await?;

        if count > 0 {
            tracing::debug!(session_id = %session_id, files = count, "Deleted staged chunks");
        }

        Ok(count)
    }
}
