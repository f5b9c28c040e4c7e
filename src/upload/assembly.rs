//! Assembly Pipeline
//!
//! Turns a fully uploaded session into one content-addressed object:
//! lease the session, validate the manifest, concatenate and re-verify the
//! staged parts, then persist under `objects/<hh>/<digest>`.

use std::sync::Arc;

use bytes::BytesMut;
use uuid::Uuid;

use crate::storage::{content_key, ObjectStore};

use super::chunk_store::ChunkStore;
use super::integrity::{compute_hash, ObjectHasher};
use super::reaper::reclaim_staging;
use super::session::SessionRegistry;
use super::types::{ChunkRecord, CompletedUpload, SessionStatus, UploadError};

/// Why an assembly attempt stopped
enum AssemblyFailure {
    /// Integrity is broken for good; the session fails
    Fatal(UploadError),
    /// Transient storage trouble; the session can be completed again
    Retryable(UploadError),
}

/// Object produced by a successful assembly
struct PersistedObject {
    key: String,
    digest: String,
    size: u64,
    deduplicated: bool,
}

/// Assembles staged chunks into final objects
#[derive(Clone)]
pub struct AssemblyPipeline {
    registry: SessionRegistry,
    chunk_store: ChunkStore,
    objects: Arc<dyn ObjectStore>,
}

impl AssemblyPipeline {
    pub fn new(registry: SessionRegistry, chunk_store: ChunkStore, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            registry,
            chunk_store,
            objects,
        }
    }

    /// Complete an upload.
    ///
    /// Completing an already completed session returns the stored result.
    pub async fn complete(&self, id: Uuid, owner_id: &str) -> Result<CompletedUpload, UploadError> {
        let (manifest, declared, expected) = {
            let mut state = self.registry.lock_owned_by(id, owner_id).await?;
            state.ensure_not_gone()?;

            match state.status() {
                SessionStatus::Completed => {
                    return state.session.completed_upload().ok_or_else(|| {
                        UploadError::Internal(format!("completed session {} has no result", id))
                    });
                }
                SessionStatus::Assembling => return Err(UploadError::AssemblyInProgress(id)),
                SessionStatus::Failed => {
                    return Err(UploadError::Conflict(format!(
                        "session {} failed integrity verification",
                        id
                    )))
                }
                _ => {}
            }

            let declared = state.session.declared_total_size;
            let received_bytes = state.received_bytes();
            let missing = state.missing_parts();

            if state.status() == SessionStatus::Initiated || !missing.is_empty() {
                return Err(UploadError::IncompleteUpload {
                    missing,
                    received_bytes,
                    declared_bytes: declared,
                });
            }
            if received_bytes != declared {
                return Err(UploadError::Validation(format!(
                    "received {} bytes but {} were declared",
                    received_bytes, declared
                )));
            }

            state.transition(SessionStatus::Assembling, self.registry.now())?;
            (
                state.manifest(),
                declared,
                state.session.expected_checksum.clone(),
            )
        };

        tracing::info!(
            session_id = %id,
            parts = manifest.len(),
            size = declared,
            "Assembling upload"
        );

        let outcome = self.assemble(id, &manifest, declared, expected.as_deref()).await;

        let mut state = self.registry.lock(id).await?;
        let now = self.registry.now();

        match outcome {
            Ok(object) => {
                state.complete(object.key, object.digest, object.deduplicated, now)?;
                let completed = state.session.completed_upload().ok_or_else(|| {
                    UploadError::Internal(format!("completed session {} has no result", id))
                })?;
                self.registry.persist(&state).await;
                drop(state);

                tracing::info!(
                    session_id = %id,
                    storage_key = %completed.storage_key,
                    size = completed.size,
                    deduplicated = completed.deduplicated,
                    "Upload completed"
                );

                reclaim_staging(&self.registry, &self.chunk_store, id).await;
                Ok(completed)
            }
            Err(AssemblyFailure::Fatal(err)) => {
                state.transition(SessionStatus::Failed, now)?;
                self.registry.persist(&state).await;
                drop(state);

                tracing::warn!(session_id = %id, error = %err, "Upload failed integrity verification");

                reclaim_staging(&self.registry, &self.chunk_store, id).await;
                Err(err)
            }
            Err(AssemblyFailure::Retryable(err)) => {
                state.transition(SessionStatus::Uploading, now)?;
                self.registry.persist(&state).await;

                tracing::warn!(session_id = %id, error = %err, "Assembly interrupted, session can be retried");
                Err(err)
            }
        }
    }

    async fn assemble(
        &self,
        id: Uuid,
        manifest: &[ChunkRecord],
        declared: u64,
        expected: Option<&str>,
    ) -> Result<PersistedObject, AssemblyFailure> {
        let mut hasher = ObjectHasher::new();
        let mut buffer = BytesMut::with_capacity(declared as usize);

        for record in manifest {
            let data = match self.chunk_store.read(id, record.part_number).await {
                Ok(data) => data,
                Err(e) if e.is_not_found() => {
                    return Err(AssemblyFailure::Fatal(UploadError::ObjectIntegrity(format!(
                        "staged part {} is missing",
                        record.part_number
                    ))))
                }
                Err(e) => return Err(AssemblyFailure::Retryable(e.into())),
            };

            if data.len() as u64 != record.byte_size || compute_hash(&data) != record.content_hash {
                return Err(AssemblyFailure::Fatal(UploadError::ObjectIntegrity(format!(
                    "staged part {} does not match its recorded hash",
                    record.part_number
                ))));
            }

            hasher.update(&data);
            buffer.extend_from_slice(&data);
        }

        let (digest, size) = hasher.finalize();

        if let Some(expected) = expected {
            if expected != digest {
                return Err(AssemblyFailure::Fatal(UploadError::ObjectIntegrity(format!(
                    "expected checksum {}, assembled object hashes to {}",
                    expected, digest
                ))));
            }
        }

        let key = content_key(&digest);
        let written = self
            .objects
            .put_if_absent(&key, buffer.freeze())
            .await
            .map_err(|e| AssemblyFailure::Retryable(e.into()))?;

        if !written {
            tracing::debug!(session_id = %id, storage_key = %key, "Object already stored, reusing");
        }

        Ok(PersistedObject {
            key,
            digest,
            size,
            deduplicated: !written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use crate::clock::SystemClock;
    use crate::error::{StorageError, StorageResult};
    use crate::storage::{ByteStream, LocalObjectStore, ObjectMetadata};
    use crate::upload::types::InitiateUploadRequest;

    const OWNER: &str = "owner-1";

    /// Wraps a store and lets tests gate or fail writes of final objects
    struct TestStore {
        inner: LocalObjectStore,
        gate: Option<Arc<Semaphore>>,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for TestStore {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn head(&self, key: &str) -> StorageResult<ObjectMetadata> {
            self.inner.head(key).await
        }

        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.get(key).await
        }

        async fn get_range_stream(&self, key: &str, offset: u64, len: u64) -> StorageResult<ByteStream> {
            self.inner.get_range_stream(key, offset, len).await
        }

        async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
            if key.starts_with("objects/") {
                if let Some(gate) = &self.gate {
                    let _permit = gate.acquire().await.unwrap();
                }
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(StorageError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "disk unavailable",
                    )));
                }
            }
            self.inner.put(key, data).await
        }

        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
            self.inner.list(prefix).await
        }

        async fn delete_prefix(&self, prefix: &str) -> StorageResult<usize> {
            self.inner.delete_prefix(prefix).await
        }
    }

    struct Fixture {
        registry: SessionRegistry,
        chunks: ChunkStore,
        pipeline: AssemblyPipeline,
        store: Arc<TestStore>,
        _dir: TempDir,
    }

    async fn fixture(gate: Option<Arc<Semaphore>>, failures: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TestStore {
            inner: LocalObjectStore::new(dir.path()).await.unwrap(),
            gate,
            failures_left: AtomicUsize::new(failures),
        });
        let registry = SessionRegistry::new(Arc::new(SystemClock), 1024 * 1024);
        let chunks = ChunkStore::new(store.clone(), 1024);
        let pipeline = AssemblyPipeline::new(registry.clone(), chunks.clone(), store.clone());
        Fixture {
            registry,
            chunks,
            pipeline,
            store,
            _dir: dir,
        }
    }

    async fn start(fx: &Fixture, size: u64, expected: Option<String>) -> Uuid {
        let request = InitiateUploadRequest {
            file_name: "book.pdf".to_string(),
            total_size: size,
            expected_sha256: expected,
            idempotency_key: None,
        };
        let (session, _) = fx.registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
        session.id
    }

    async fn stage(fx: &Fixture, id: Uuid, part: u32, data: &[u8]) {
        fx.chunks.put(id, part, Bytes::copy_from_slice(data)).await.unwrap();
        fx.registry
            .record_chunk(
                id,
                ChunkRecord {
                    session_id: id,
                    part_number: part,
                    byte_size: data.len() as u64,
                    content_hash: compute_hash(data),
                    received_at: Utc::now(),
                },
            )
            .await
            .unwrap();
    }

    async fn status(fx: &Fixture, id: Uuid) -> SessionStatus {
        fx.registry.lock(id).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_complete_assembles_in_order() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 9, None).await;
        stage(&fx, id, 2, b"ghi").await;
        stage(&fx, id, 0, b"abc").await;
        stage(&fx, id, 1, b"def").await;

        let completed = fx.pipeline.complete(id, OWNER).await.unwrap();
        assert_eq!(completed.checksum, compute_hash(b"abcdefghi"));
        assert_eq!(completed.storage_key, content_key(&completed.checksum));
        assert_eq!(completed.size, 9);
        assert!(!completed.deduplicated);

        let stored = fx.store.get(&completed.storage_key).await.unwrap();
        assert_eq!(stored, Bytes::from_static(b"abcdefghi"));

        // Staging was reclaimed
        assert!(fx.chunks.read(id, 0).await.unwrap_err().is_not_found());
        assert!(fx.registry.lock(id).await.unwrap().staging_reclaimed);

        // Repeated completion returns the same result
        let again = fx.pipeline.complete(id, OWNER).await.unwrap();
        assert_eq!(again.storage_key, completed.storage_key);
        assert_eq!(again.completed_at, completed.completed_at);
    }

    #[tokio::test]
    async fn test_incomplete_upload_lists_missing_parts() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 9, None).await;

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::IncompleteUpload { ref missing, .. }) if missing == &vec![0]
        ));

        stage(&fx, id, 0, b"abc").await;
        stage(&fx, id, 2, b"ghi").await;

        match fx.pipeline.complete(id, OWNER).await {
            Err(UploadError::IncompleteUpload {
                missing,
                received_bytes,
                declared_bytes,
            }) => {
                assert_eq!(missing, vec![1]);
                assert_eq!(received_bytes, 6);
                assert_eq!(declared_bytes, 9);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(status(&fx, id).await, SessionStatus::Uploading);
    }

    #[tokio::test]
    async fn test_oversized_manifest_is_validation_error() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 4, None).await;
        stage(&fx, id, 0, b"abc").await;
        stage(&fx, id, 1, b"def").await;

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::Validation(_))
        ));
        assert_eq!(status(&fx, id).await, SessionStatus::Uploading);
    }

    #[tokio::test]
    async fn test_expected_checksum_mismatch_fails_session() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 3, Some("0".repeat(64))).await;
        stage(&fx, id, 0, b"abc").await;

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::ObjectIntegrity(_))
        ));
        assert_eq!(status(&fx, id).await, SessionStatus::Failed);
        assert!(fx.chunks.read(id, 0).await.unwrap_err().is_not_found());

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_staging_fails_session() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 6, None).await;
        stage(&fx, id, 0, b"abc").await;
        stage(&fx, id, 1, b"def").await;

        // Same length, different bytes
        fx.chunks.put(id, 1, Bytes::from_static(b"xyz")).await.unwrap();

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::ObjectIntegrity(_))
        ));
        assert_eq!(status(&fx, id).await, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn test_storage_failure_is_retryable() {
        let fx = fixture(None, 1).await;
        let id = start(&fx, 3, None).await;
        stage(&fx, id, 0, b"abc").await;

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::Storage(_))
        ));
        assert_eq!(status(&fx, id).await, SessionStatus::Uploading);

        let completed = fx.pipeline.complete(id, OWNER).await.unwrap();
        assert_eq!(completed.checksum, compute_hash(b"abc"));
    }

    #[tokio::test]
    async fn test_concurrent_completion_is_rejected() {
        let gate = Arc::new(Semaphore::new(0));
        let fx = fixture(Some(gate.clone()), 0).await;
        let id = start(&fx, 3, None).await;
        stage(&fx, id, 0, b"abc").await;

        let pipeline = fx.pipeline.clone();
        let first = tokio::spawn(async move { pipeline.complete(id, OWNER).await });

        // Wait until the first request holds the lease
        while status(&fx, id).await != SessionStatus::Assembling {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            fx.pipeline.complete(id, OWNER).await,
            Err(UploadError::AssemblyInProgress(_))
        ));

        gate.add_permits(1);
        let completed = first.await.unwrap().unwrap();
        assert_eq!(completed.size, 3);
        assert_eq!(status(&fx, id).await, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let fx = fixture(None, 0).await;

        let first = start(&fx, 3, None).await;
        stage(&fx, first, 0, b"abc").await;
        let a = fx.pipeline.complete(first, OWNER).await.unwrap();

        let second = start(&fx, 3, None).await;
        stage(&fx, second, 0, b"a").await;
        stage(&fx, second, 1, b"bc").await;
        let b = fx.pipeline.complete(second, OWNER).await.unwrap();

        assert_eq!(a.storage_key, b.storage_key);
        assert!(!a.deduplicated);
        assert!(b.deduplicated);
    }

    #[tokio::test]
    async fn test_foreign_owner_cannot_complete() {
        let fx = fixture(None, 0).await;
        let id = start(&fx, 3, None).await;
        stage(&fx, id, 0, b"abc").await;

        assert!(matches!(
            fx.pipeline.complete(id, "someone-else").await,
            Err(UploadError::SessionNotFound(_))
        ));
    }
}
