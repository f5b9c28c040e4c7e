//! Upload Service
//!
//! Entry point for the upload protocol. Ties the registry, the staging
//! store and the assembly pipeline together for the HTTP handlers.

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::UploadLimits;
use crate::error::StorageResult;
use crate::storage::{content_key, ObjectStore};

use super::assembly::AssemblyPipeline;
use super::chunk_store::ChunkStore;
use super::integrity;
use super::journal::SessionJournal;
use super::reaper::{reclaim_staging, SessionReaper};
use super::session::SessionRegistry;
use super::types::{
    ChunkReceipt, ChunkRecord, ChunkStatus, CompletedUpload, InitiateUploadRequest,
    InitiateUploadResponse, SessionSnapshot, UploadError, UploadSession,
};

/// Chunked upload service
#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    registry: SessionRegistry,
    chunk_store: ChunkStore,
    assembly: AssemblyPipeline,
    objects: Arc<dyn ObjectStore>,
    limits: UploadLimits,
}

impl UploadService {
    /// Service with no sessions yet. Sessions are journaled to `store`.
    pub fn new(store: Arc<dyn ObjectStore>, clock: SharedClock, limits: UploadLimits) -> Self {
        let journal = SessionJournal::new(store.clone());
        let registry = SessionRegistry::with_journal(clock, limits.max_file_size, journal);
        Self::build(registry, store, limits)
    }

    /// Service resuming the sessions journaled in `store`
    pub async fn open(store: Arc<dyn ObjectStore>, clock: SharedClock, limits: UploadLimits) -> StorageResult<Self> {
        let journal = SessionJournal::new(store.clone());
        let registry = SessionRegistry::open(clock, limits.max_file_size, journal).await?;
        Ok(Self::build(registry, store, limits))
    }

    fn build(registry: SessionRegistry, store: Arc<dyn ObjectStore>, limits: UploadLimits) -> Self {
        let chunk_store = ChunkStore::new(store.clone(), limits.max_chunk_size);
        let assembly = AssemblyPipeline::new(registry.clone(), chunk_store.clone(), store.clone());

        Self {
            inner: Arc::new(UploadServiceInner {
                registry,
                chunk_store,
                assembly,
                objects: store,
                limits,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.inner.limits
    }

    /// Background reaper over this service's sessions
    pub fn reaper(&self) -> SessionReaper {
        SessionReaper::new(
            self.inner.registry.clone(),
            self.inner.chunk_store.clone(),
            self.inner.limits.reaper_interval,
            self.inner.limits.terminal_retention,
        )
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Initiate an upload. Returns the response and whether a new session was created.
    ///
    /// When the expected checksum names an object that is already stored
    /// with the declared size, the session is created completed and no
    /// chunks need to be sent.
    pub async fn initiate(
        &self,
        owner_id: &str,
        request: &InitiateUploadRequest,
    ) -> Result<(InitiateUploadResponse, bool), UploadError> {
        let ttl = self.inner.limits.session_ttl;

        let (session, created) = match self.stored_object(request).await? {
            Some(storage_key) => {
                self.inner
                    .registry
                    .create_deduplicated(owner_id, request, ttl, storage_key)
                    .await?
            }
            None => self.inner.registry.create(owner_id, request, ttl).await?,
        };

        let response = InitiateUploadResponse {
            upload_id: session.id,
            status: session.status,
            max_chunk_size: self.inner.chunk_store.max_chunk_size(),
            expires_at: session.expires_at,
            storage_key: session.final_storage_key.clone(),
        };
        Ok((response, created))
    }

    /// Key of a stored object matching the request's expected checksum and size
    async fn stored_object(&self, request: &InitiateUploadRequest) -> Result<Option<String>, UploadError> {
        let Some(expected) = request.expected_sha256.as_deref() else {
            return Ok(None);
        };

        let key = content_key(&integrity::normalize_hash(expected)?);
        match self.inner.objects.head(&key).await {
            Ok(metadata) if metadata.size == request.total_size => {
                tracing::info!(storage_key = %key, "Expected object already stored");
                Ok(Some(key))
            }
            Ok(metadata) => {
                tracing::debug!(
                    storage_key = %key,
                    stored_size = metadata.size,
                    declared_size = request.total_size,
                    "Stored object size differs from declared size"
                );
                Ok(None)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Session with its chunk manifest
    pub async fn session(&self, id: Uuid, owner_id: &str) -> Result<SessionSnapshot, UploadError> {
        self.inner.registry.get(id, owner_id).await
    }

    /// Cancel an open session and delete its staged chunks
    pub async fn cancel(&self, id: Uuid, owner_id: &str) -> Result<UploadSession, UploadError> {
        let session = self.inner.registry.cancel(id, owner_id).await?;
        reclaim_staging(&self.inner.registry, &self.inner.chunk_store, id).await;
        Ok(session)
    }

    /// Assemble a fully uploaded session
    pub async fn complete(&self, id: Uuid, owner_id: &str) -> Result<CompletedUpload, UploadError> {
        self.inner.assembly.complete(id, owner_id).await
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Verify, stage and record one chunk within the transfer timeout.
    pub async fn upload_chunk(
        &self,
        id: Uuid,
        owner_id: &str,
        part_number: u32,
        data: Bytes,
        declared_hash: Option<&str>,
    ) -> Result<ChunkReceipt, UploadError> {
        let deadline = Instant::now() + self.inner.limits.chunk_transfer_timeout;
        self.upload_chunk_until(id, owner_id, part_number, data, declared_hash, deadline)
            .await
    }

    /// Verify, stage and record one chunk, giving up at `deadline`.
    ///
    /// Re-sending a part with identical bytes is a no-op; different bytes
    /// for a recorded part are a conflict. A re-send that arrives while the
    /// same bytes are still being staged waits for that transfer and then
    /// answers as a duplicate.
    pub async fn upload_chunk_until(
        &self,
        id: Uuid,
        owner_id: &str,
        part_number: u32,
        data: Bytes,
        declared_hash: Option<&str>,
        deadline: Instant,
    ) -> Result<ChunkReceipt, UploadError> {
        if data.is_empty() {
            return Err(UploadError::Validation("chunk body must not be empty".to_string()));
        }

        let size = data.len() as u64;
        let mut verified: Option<String> = None;

        let hash = loop {
            let mut state = self.inner.registry.lock_owned_by(id, owner_id).await?;
            state.ensure_open()?;

            let hash = match verified.clone() {
                Some(hash) => hash,
                None => {
                    let hash = integrity::verify(&data, declared_hash).map_err(|err| {
                        tracing::warn!(
                            session_id = %id,
                            part_number = part_number,
                            error = %err,
                            "Rejected chunk"
                        );
                        err
                    })?;
                    verified = Some(hash.clone());
                    hash
                }
            };

            if let Some(existing) = state.chunk(part_number) {
                if existing.content_hash == hash {
                    return Ok(ChunkReceipt {
                        part_number,
                        size,
                        hash,
                        chunks_received: state.chunk_count(),
                        duplicate: true,
                    });
                }
                return Err(UploadError::PartConflict {
                    part_number,
                    existing: existing.content_hash.clone(),
                    received: hash,
                });
            }

            let Some(done) = state.pending_transfer(part_number, &hash)? else {
                self.inner.chunk_store.admit(
                    state.session.declared_total_size,
                    state.staged_bytes(),
                    size,
                )?;
                state.reserve(part_number, size, &hash)?;
                break hash;
            };

            // Registered while the lock is held
            let finished = done.notified();
            drop(state);

            tracing::debug!(session_id = %id, part_number = part_number, "Waiting for in-flight transfer");
            if timeout_at(deadline, finished).await.is_err() {
                return Err(self.transfer_timeout(id, part_number));
            }
        };

        let staged = match timeout_at(deadline, self.inner.chunk_store.put(id, part_number, data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(UploadError::Storage(e)),
            Err(_) => Err(self.transfer_timeout(id, part_number)),
        };

        // Reservation stays held until the outcome is settled
        let mut state = self.inner.registry.lock(id).await?;

        if let Err(err) = staged {
            tracing::warn!(session_id = %id, part_number = part_number, error = %err, "Failed to stage chunk");
            self.discard(id, part_number).await;
            state.release(part_number);
            return Err(err);
        }

        let now = self.inner.registry.now();
        if state.expire_if_due(now) {
            self.inner.registry.persist(&state).await;
        }

        let record = ChunkRecord {
            session_id: id,
            part_number,
            byte_size: size,
            content_hash: hash.clone(),
            received_at: now,
        };
        let recorded = match state.ensure_open() {
            Ok(()) => self.inner.registry.commit_chunk(&mut state, record, now).await,
            Err(err) => Err(err),
        };

        if recorded.is_err() {
            self.discard(id, part_number).await;
        }
        state.release(part_number);
        let newly_recorded = recorded?;

        tracing::debug!(
            session_id = %id,
            part_number = part_number,
            size = size,
            hash = %hash,
            "Recorded chunk"
        );

        Ok(ChunkReceipt {
            part_number,
            size,
            hash,
            chunks_received: state.chunk_count(),
            duplicate: !newly_recorded,
        })
    }

    /// Status of a part, from the manifest only
    pub async fn chunk_status(&self, id: Uuid, owner_id: &str, part_number: u32) -> Result<ChunkStatus, UploadError> {
        let state = self.inner.registry.lock_owned_by(id, owner_id).await?;
        state.ensure_not_gone()?;
        Ok(ChunkStore::status_of(&state, part_number))
    }

    fn transfer_timeout(&self, id: Uuid, part_number: u32) -> UploadError {
        tracing::warn!(session_id = %id, part_number = part_number, "Chunk transfer timed out");
        UploadError::TransferTimeout(self.inner.limits.chunk_transfer_timeout.as_secs())
    }

    async fn discard(&self, id: Uuid, part_number: u32) {
        if let Err(e) = self.inner.chunk_store.discard(id, part_number).await {
            tracing::warn!(session_id = %id, part_number = part_number, error = %e, "Failed to discard staged chunk");
        }
    }
}
