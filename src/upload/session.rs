//! Upload Session Registry
//!
//! Owns session and chunk metadata with:
//! - A global map locked only for lookup and insert
//! - One async mutex per session, so distinct sessions never contend
//! - Lazy expiry of sessions observed past their deadline
//! - Idempotent session creation keyed by (owner, idempotency key)
//! - An optional journal that makes sessions survive restarts
//! - Tombstones so purged expired and cancelled ids keep answering Gone

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::StorageResult;

use super::integrity::normalize_hash;
use super::journal::{JournalEntry, SessionJournal, SessionRecord, Tombstone};
use super::types::{
    ChunkRecord, InitiateUploadRequest, SessionSnapshot, SessionStatus, UploadError,
    UploadSession,
};

type SessionHandle = Arc<Mutex<SessionState>>;

// ============================================================================
// Session State
// ============================================================================

/// A part whose bytes are being transferred
#[derive(Debug)]
struct InFlight {
    size: u64,
    hash: String,
    /// Woken when the transfer finishes, either way
    done: Arc<Notify>,
}

/// A session with its chunk manifest and in-flight reservations
#[derive(Debug)]
pub struct SessionState {
    pub session: UploadSession,

    /// Recorded parts by part number
    chunks: BTreeMap<u32, ChunkRecord>,

    /// Parts currently being transferred
    in_flight: HashMap<u32, InFlight>,

    /// Time of the last status change
    pub updated_at: DateTime<Utc>,

    /// Staged chunks of a finished session have been deleted
    pub staging_reclaimed: bool,
}

impl SessionState {
    fn new(session: UploadSession) -> Self {
        let updated_at = session.created_at;
        Self {
            session,
            chunks: BTreeMap::new(),
            in_flight: HashMap::new(),
            updated_at,
            staging_reclaimed: false,
        }
    }

    /// Rebuild a session from its journal record.
    ///
    /// An assembly lease does not outlive the process that held it.
    fn from_record(record: SessionRecord) -> Self {
        let mut session = record.session;
        if session.status == SessionStatus::Assembling {
            session.status = SessionStatus::Uploading;
        }

        Self {
            session,
            chunks: record
                .chunks
                .into_iter()
                .map(|chunk| (chunk.part_number, chunk))
                .collect(),
            in_flight: HashMap::new(),
            updated_at: record.updated_at,
            staging_reclaimed: record.staging_reclaimed,
        }
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session: self.session.clone(),
            chunks: self.manifest(),
            updated_at: self.updated_at,
            staging_reclaimed: self.staging_reclaimed,
        }
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    /// Sessions owned by someone else are indistinguishable from unknown ones
    pub fn authorize(&self, owner_id: &str) -> Result<(), UploadError> {
        if self.session.owner_id != owner_id {
            return Err(UploadError::SessionNotFound(self.session.id.to_string()));
        }
        Ok(())
    }

    /// Move an open session past its deadline to EXPIRED.
    ///
    /// Returns `true` if the transition happened now.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.session.status.is_open() && self.session.is_expired(now) {
            self.session.status = SessionStatus::Expired;
            self.updated_at = now;
            for (_, transfer) in self.in_flight.drain() {
                transfer.done.notify_waiters();
            }
            return true;
        }
        false
    }

    /// Reject sessions that were expired or cancelled
    pub fn ensure_not_gone(&self) -> Result<(), UploadError> {
        match self.session.status {
            SessionStatus::Expired | SessionStatus::Cancelled => Err(UploadError::SessionGone {
                id: self.session.id,
                status: self.session.status,
            }),
            _ => Ok(()),
        }
    }

    /// Reject sessions that can no longer accept chunks
    pub fn ensure_open(&self) -> Result<(), UploadError> {
        self.ensure_not_gone()?;
        match self.session.status {
            SessionStatus::Initiated | SessionStatus::Uploading => Ok(()),
            SessionStatus::Assembling => Err(UploadError::AssemblyInProgress(self.session.id)),
            status => Err(UploadError::Conflict(format!(
                "session {} is {}",
                self.session.id, status
            ))),
        }
    }

    /// Finished session whose staged chunks still need deleting
    pub fn needs_reclaim(&self) -> bool {
        self.session.status.is_terminal() && !self.staging_reclaimed
    }

    pub fn chunk(&self, part_number: u32) -> Option<&ChunkRecord> {
        self.chunks.get(&part_number)
    }

    /// Recorded chunks, ascending by part number
    pub fn manifest(&self) -> Vec<ChunkRecord> {
        self.chunks.values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes of recorded chunks
    pub fn received_bytes(&self) -> u64 {
        self.chunks.values().map(|c| c.byte_size).sum()
    }

    /// Bytes recorded plus bytes reserved by in-flight transfers
    pub fn staged_bytes(&self) -> u64 {
        self.received_bytes() + self.in_flight.values().map(|t| t.size).sum::<u64>()
    }

    /// Transfer of the same bytes already under way for a part.
    ///
    /// A concurrent transfer of different bytes for the part is a conflict.
    pub fn pending_transfer(&self, part_number: u32, hash: &str) -> Result<Option<Arc<Notify>>, UploadError> {
        match self.in_flight.get(&part_number) {
            None => Ok(None),
            Some(transfer) if transfer.hash == hash => Ok(Some(transfer.done.clone())),
            Some(_) => Err(UploadError::Conflict(format!(
                "different bytes for part {} are already being uploaded",
                part_number
            ))),
        }
    }

    /// Reserve staging budget for a part about to be transferred
    pub fn reserve(&mut self, part_number: u32, size: u64, hash: &str) -> Result<(), UploadError> {
        if self.in_flight.contains_key(&part_number) {
            return Err(UploadError::Conflict(format!(
                "part {} is already being uploaded",
                part_number
            )));
        }
        self.in_flight.insert(
            part_number,
            InFlight {
                size,
                hash: hash.to_string(),
                done: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    /// End a transfer and wake anyone waiting on it
    pub fn release(&mut self, part_number: u32) {
        if let Some(transfer) = self.in_flight.remove(&part_number) {
            transfer.done.notify_waiters();
        }
    }

    /// Record a verified, staged chunk.
    ///
    /// Returns `false` when the identical part was already recorded.
    pub fn record_chunk(&mut self, record: ChunkRecord, now: DateTime<Utc>) -> Result<bool, UploadError> {
        if let Some(existing) = self.chunks.get(&record.part_number) {
            if existing.content_hash == record.content_hash {
                return Ok(false);
            }
            return Err(UploadError::PartConflict {
                part_number: record.part_number,
                existing: existing.content_hash.clone(),
                received: record.content_hash,
            });
        }

        self.chunks.insert(record.part_number, record);
        if self.session.status == SessionStatus::Initiated {
            self.transition(SessionStatus::Uploading, now)?;
        }
        Ok(true)
    }

    /// Undo a `record_chunk` that could not be made durable
    fn unrecord_chunk(&mut self, part_number: u32, previous_status: SessionStatus, previous_update: DateTime<Utc>) {
        self.chunks.remove(&part_number);
        self.session.status = previous_status;
        self.updated_at = previous_update;
    }

    /// Apply a status change allowed by the transition table
    pub fn transition(&mut self, next: SessionStatus, now: DateTime<Utc>) -> Result<(), UploadError> {
        let current = self.session.status;
        if !current.can_transition_to(next) {
            return Err(UploadError::Conflict(format!(
                "illegal transition {} -> {} for session {}",
                current, next, self.session.id
            )));
        }

        self.session.status = next;
        self.updated_at = now;

        tracing::debug!(
            session_id = %self.session.id,
            from = %current,
            to = %next,
            "Session status changed"
        );
        Ok(())
    }

    /// Finish an assembling session with its persisted object
    pub fn complete(
        &mut self,
        storage_key: String,
        checksum: String,
        deduplicated: bool,
        now: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        self.transition(SessionStatus::Completed, now)?;
        self.session.final_storage_key = Some(storage_key);
        self.session.final_checksum = Some(checksum);
        self.session.completed_at = Some(now);
        self.session.deduplicated = deduplicated;
        Ok(())
    }

    /// Parts needed before the manifest covers the declared size.
    ///
    /// Gaps below the highest recorded part, or the next part number when
    /// the recorded parts are contiguous but short.
    pub fn missing_parts(&self) -> Vec<u32> {
        let Some(&last) = self.chunks.keys().next_back() else {
            return vec![0];
        };

        let mut missing: Vec<u32> = (0..last).filter(|p| !self.chunks.contains_key(p)).collect();
        if missing.is_empty() && self.received_bytes() < self.session.declared_total_size {
            missing.push(last + 1);
        }
        missing
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            chunks: self.manifest(),
            received_bytes: self.received_bytes(),
        }
    }
}

// ============================================================================
// Session Registry
// ============================================================================

/// Registry of upload sessions
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    /// Sessions indexed by ID
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,

    /// (owner, idempotency key) -> session ID
    idempotency: RwLock<HashMap<(String, String), Uuid>>,

    /// Purged sessions that still answer Gone
    tombstones: RwLock<HashMap<Uuid, Tombstone>>,

    /// Durable copy of the sessions, if any
    journal: Option<SessionJournal>,

    clock: SharedClock,

    max_file_size: u64,
}

impl SessionRegistry {
    /// In-memory registry
    pub fn new(clock: SharedClock, max_file_size: u64) -> Self {
        Self::build(clock, max_file_size, None)
    }

    /// Empty registry that writes every session change to `journal`
    pub fn with_journal(clock: SharedClock, max_file_size: u64, journal: SessionJournal) -> Self {
        Self::build(clock, max_file_size, Some(journal))
    }

    fn build(clock: SharedClock, max_file_size: u64, journal: Option<SessionJournal>) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: RwLock::new(HashMap::new()),
                idempotency: RwLock::new(HashMap::new()),
                tombstones: RwLock::new(HashMap::new()),
                journal,
                clock,
                max_file_size,
            }),
        }
    }

    /// Registry restored from `journal`
    pub async fn open(clock: SharedClock, max_file_size: u64, journal: SessionJournal) -> StorageResult<Self> {
        let entries = journal.load().await?;
        let registry = Self::with_journal(clock, max_file_size, journal);

        {
            let mut sessions = registry.inner.sessions.write().await;
            let mut idempotency = registry.inner.idempotency.write().await;
            let mut tombstones = registry.inner.tombstones.write().await;

            for entry in entries {
                match entry {
                    JournalEntry::Session(record) => {
                        let state = SessionState::from_record(record);
                        let id = state.id();
                        if let Some(key) = &state.session.idempotency_key {
                            idempotency.insert((state.session.owner_id.clone(), key.clone()), id);
                        }
                        sessions.insert(id, Arc::new(Mutex::new(state)));
                    }
                    JournalEntry::Tombstone(tombstone) => {
                        tombstones.insert(tombstone.id, tombstone);
                    }
                }
            }

            tracing::info!(
                sessions = sessions.len(),
                tombstones = tombstones.len(),
                "Restored upload sessions"
            );
        }

        Ok(registry)
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    // ========================================================================
    // Journal
    // ========================================================================

    /// Write a session to the journal
    pub async fn save(&self, state: &SessionState) -> StorageResult<()> {
        match &self.inner.journal {
            Some(journal) => journal.save(&JournalEntry::Session(state.to_record())).await,
            None => Ok(()),
        }
    }

    /// Write a session to the journal, logging failures.
    ///
    /// Used after status changes; the in-memory state stays authoritative
    /// and the next successful write catches the journal up.
    pub async fn persist(&self, state: &SessionState) {
        if let Err(e) = self.save(state).await {
            tracing::warn!(session_id = %state.id(), error = %e, "Failed to journal session");
        }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Create a new upload session.
    ///
    /// Returns the session and whether it was newly created; a repeated
    /// idempotency key returns the still-open session it created before.
    pub async fn create(
        &self,
        owner_id: &str,
        request: &InitiateUploadRequest,
        ttl: Duration,
    ) -> Result<(UploadSession, bool), UploadError> {
        self.create_session(owner_id, request, ttl, None).await
    }

    /// Create a session that is already complete because the object named
    /// by its expected checksum is stored.
    pub async fn create_deduplicated(
        &self,
        owner_id: &str,
        request: &InitiateUploadRequest,
        ttl: Duration,
        storage_key: String,
    ) -> Result<(UploadSession, bool), UploadError> {
        self.create_session(owner_id, request, ttl, Some(storage_key)).await
    }

    async fn create_session(
        &self,
        owner_id: &str,
        request: &InitiateUploadRequest,
        ttl: Duration,
        existing_object: Option<String>,
    ) -> Result<(UploadSession, bool), UploadError> {
        if request.file_name.trim().is_empty() {
            return Err(UploadError::Validation("file name must not be empty".to_string()));
        }
        if request.total_size == 0 {
            return Err(UploadError::Validation("total size must be greater than zero".to_string()));
        }
        if request.total_size > self.inner.max_file_size {
            return Err(UploadError::Validation(format!(
                "total size {} exceeds maximum of {} bytes",
                request.total_size, self.inner.max_file_size
            )));
        }
        if ttl <= Duration::zero() {
            return Err(UploadError::Validation("session ttl must be positive".to_string()));
        }

        let expected_checksum = request
            .expected_sha256
            .as_deref()
            .map(normalize_hash)
            .transpose()?;

        // Held across the lookup and insert so concurrent creates with the
        // same key cannot both succeed
        let mut idempotency = self.inner.idempotency.write().await;

        let idempotency_key = request
            .idempotency_key
            .as_ref()
            .map(|key| (owner_id.to_string(), key.clone()));

        if let Some(key) = &idempotency_key {
            if let Some(existing_id) = idempotency.get(key).copied() {
                if let Some(existing) = self.reuse_session(existing_id).await {
                    tracing::debug!(
                        session_id = %existing.id,
                        "Reusing session for idempotency key"
                    );
                    return Ok((existing, false));
                }
            }
        }

        let now = self.now();
        let mut state = SessionState::new(UploadSession::new(
            owner_id,
            request,
            expected_checksum.clone(),
            now,
            ttl,
        ));

        if let (Some(storage_key), Some(checksum)) = (existing_object, expected_checksum) {
            let session = &mut state.session;
            session.status = SessionStatus::Completed;
            session.final_storage_key = Some(storage_key);
            session.final_checksum = Some(checksum);
            session.completed_at = Some(now);
            session.deduplicated = true;
            state.staging_reclaimed = true;
        }

        self.save(&state).await?;

        let session = state.session.clone();
        let id = session.id;

        {
            let mut sessions = self.inner.sessions.write().await;
            sessions.insert(id, Arc::new(Mutex::new(state)));
        }

        if let Some(key) = idempotency_key {
            idempotency.insert(key, id);
        }

        tracing::info!(
            session_id = %id,
            file_name = %session.declared_file_name,
            total_size = session.declared_total_size,
            status = %session.status,
            "Created upload session"
        );

        Ok((session, true))
    }

    /// Session still usable for a repeated create
    async fn reuse_session(&self, id: Uuid) -> Option<UploadSession> {
        let handle = self.handle(id).await.ok()?;
        let mut state = handle.lock().await;
        if state.expire_if_due(self.now()) {
            self.persist(&state).await;
        }
        match state.status() {
            SessionStatus::Completed if state.session.deduplicated => Some(state.session.clone()),
            status if status.is_terminal() => None,
            _ => Some(state.session.clone()),
        }
    }

    async fn handle(&self, id: Uuid) -> Result<SessionHandle, UploadError> {
        let handle = {
            let sessions = self.inner.sessions.read().await;
            sessions.get(&id).cloned()
        };

        match handle {
            Some(handle) => Ok(handle),
            None => Err(self.missing(id, None).await),
        }
    }

    /// Error for an id with no live session: Gone for a tombstone the caller
    /// may see, NotFound otherwise
    async fn missing(&self, id: Uuid, owner_id: Option<&str>) -> UploadError {
        let tombstones = self.inner.tombstones.read().await;
        match tombstones.get(&id) {
            Some(tombstone) if owner_id.map_or(true, |owner| owner == tombstone.owner_id) => {
                UploadError::SessionGone {
                    id,
                    status: tombstone.status,
                }
            }
            _ => UploadError::SessionNotFound(id.to_string()),
        }
    }

    /// Lock a session for a multi-step mutation
    pub async fn lock(&self, id: Uuid) -> Result<OwnedMutexGuard<SessionState>, UploadError> {
        let handle = self.handle(id).await?;
        Ok(handle.lock_owned().await)
    }

    /// Lock a session on behalf of its owner, applying lazy expiry
    pub async fn lock_owned_by(
        &self,
        id: Uuid,
        owner_id: &str,
    ) -> Result<OwnedMutexGuard<SessionState>, UploadError> {
        let handle = {
            let sessions = self.inner.sessions.read().await;
            sessions.get(&id).cloned()
        };
        let Some(handle) = handle else {
            return Err(self.missing(id, Some(owner_id)).await);
        };

        let mut state = handle.lock_owned().await;
        state.authorize(owner_id)?;
        if state.expire_if_due(self.now()) {
            tracing::info!(session_id = %id, "Upload session expired");
            self.persist(&state).await;
        }
        Ok(state)
    }

    /// Session and chunk manifest
    pub async fn get(&self, id: Uuid, owner_id: &str) -> Result<SessionSnapshot, UploadError> {
        let state = self.lock_owned_by(id, owner_id).await?;
        state.ensure_not_gone()?;
        Ok(state.snapshot())
    }

    /// Record a chunk on a locked session and journal the new manifest.
    ///
    /// A chunk that cannot be journaled is not recorded.
    pub async fn commit_chunk(
        &self,
        state: &mut SessionState,
        record: ChunkRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, UploadError> {
        let part_number = record.part_number;
        let previous_status = state.status();
        let previous_update = state.updated_at;

        if !state.record_chunk(record, now)? {
            return Ok(false);
        }

        if let Err(e) = self.save(state).await {
            state.unrecord_chunk(part_number, previous_status, previous_update);
            return Err(e.into());
        }
        Ok(true)
    }

    /// Record a verified, staged chunk. Returns `false` for an idempotent repeat.
    pub async fn record_chunk(&self, id: Uuid, record: ChunkRecord) -> Result<bool, UploadError> {
        let mut state = self.lock(id).await?;
        let now = self.now();
        if state.expire_if_due(now) {
            self.persist(&state).await;
        }
        state.ensure_open()?;
        self.commit_chunk(&mut state, record, now).await
    }

    /// Apply a status change. Completion goes through the assembly pipeline.
    pub async fn mark_status(&self, id: Uuid, status: SessionStatus) -> Result<UploadSession, UploadError> {
        if status == SessionStatus::Completed {
            return Err(UploadError::Conflict(
                "sessions complete only through assembly".to_string(),
            ));
        }

        let mut state = self.lock(id).await?;
        state.transition(status, self.now())?;
        self.persist(&state).await;
        Ok(state.session.clone())
    }

    /// Recorded chunks, ascending by part number
    pub async fn list_chunks(&self, id: Uuid) -> Result<Vec<ChunkRecord>, UploadError> {
        let state = self.lock(id).await?;
        Ok(state.manifest())
    }

    /// Cancel an open session
    pub async fn cancel(&self, id: Uuid, owner_id: &str) -> Result<UploadSession, UploadError> {
        let mut state = self.lock_owned_by(id, owner_id).await?;
        state.ensure_open()?;
        state.transition(SessionStatus::Cancelled, self.now())?;
        self.persist(&state).await;

        tracing::info!(
            session_id = %id,
            file_name = %state.session.declared_file_name,
            "Upload session cancelled"
        );

        Ok(state.session.clone())
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// All session IDs
    pub async fn ids(&self) -> Vec<Uuid> {
        let sessions = self.inner.sessions.read().await;
        sessions.keys().copied().collect()
    }

    /// Drop a session record.
    ///
    /// Expired and cancelled sessions leave a tombstone behind so their id
    /// keeps answering Gone.
    pub async fn remove(&self, id: Uuid) -> Option<UploadSession> {
        let handle = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(&id)?
        };

        let session = handle.lock().await.session.clone();

        if let Some(key) = &session.idempotency_key {
            let mut idempotency = self.inner.idempotency.write().await;
            let entry = (session.owner_id.clone(), key.clone());
            if idempotency.get(&entry) == Some(&id) {
                idempotency.remove(&entry);
            }
        }

        let tombstone = matches!(session.status, SessionStatus::Expired | SessionStatus::Cancelled)
            .then(|| Tombstone {
                id,
                owner_id: session.owner_id.clone(),
                status: session.status,
            });

        if let Some(tombstone) = &tombstone {
            let mut tombstones = self.inner.tombstones.write().await;
            tombstones.insert(id, tombstone.clone());
        }

        if let Some(journal) = &self.inner.journal {
            let written = match tombstone {
                Some(tombstone) => journal.save(&JournalEntry::Tombstone(tombstone)).await,
                None => journal.remove(id).await,
            };
            if let Err(e) = written {
                tracing::warn!(session_id = %id, error = %e, "Failed to journal purged session");
            }
        }

        Some(session)
    }

    /// Live session count
    pub async fn len(&self) -> usize {
        let sessions = self.inner.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const OWNER: &str = "owner-1";

    fn create_test_request(size: u64) -> InitiateUploadRequest {
        InitiateUploadRequest {
            file_name: "test.epub".to_string(),
            total_size: size,
            expected_sha256: None,
            idempotency_key: None,
        }
    }

    fn registry() -> (SessionRegistry, ManualClock) {
        let clock = ManualClock::default();
        (SessionRegistry::new(Arc::new(clock.clone()), 1024 * 1024), clock)
    }

    fn record(id: Uuid, part: u32, size: u64, hash: &str) -> ChunkRecord {
        ChunkRecord {
            session_id: id,
            part_number: part,
            byte_size: size,
            content_hash: hash.to_string(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_session() {
        let (registry, _clock) = registry();
        let (session, created) = registry
            .create(OWNER, &create_test_request(300), Duration::hours(24))
            .await
            .unwrap();

        assert!(created);
        assert_eq!(session.status, SessionStatus::Initiated);
        assert_eq!(session.declared_total_size, 300);
        assert!(session.expires_at > session.created_at);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let (registry, _clock) = registry();
        let ttl = Duration::hours(1);

        for request in [
            create_test_request(0),
            create_test_request(2 * 1024 * 1024),
            InitiateUploadRequest {
                file_name: "  ".to_string(),
                ..create_test_request(10)
            },
            InitiateUploadRequest {
                expected_sha256: Some("xyz".to_string()),
                ..create_test_request(10)
            },
        ] {
            let result = registry.create(OWNER, &request, ttl).await;
            assert!(matches!(result, Err(UploadError::Validation(_))));
        }
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_idempotent_create() {
        let (registry, _clock) = registry();
        let request = InitiateUploadRequest {
            idempotency_key: Some("key-1".to_string()),
            ..create_test_request(100)
        };

        let (first, _) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
        let (second, created) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(!created);

        // Same key from another owner is a different session
        let (other, _) = registry.create("owner-2", &request, Duration::hours(1)).await.unwrap();
        assert_ne!(other.id, first.id);

        // A cancelled session is not reused
        registry.cancel(first.id, OWNER).await.unwrap();
        let (third, created) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
        assert!(created);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_get_hides_foreign_sessions() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(10), Duration::hours(1))
            .await
            .unwrap();

        assert!(registry.get(session.id, OWNER).await.is_ok());
        assert!(matches!(
            registry.get(session.id, "intruder").await,
            Err(UploadError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.get(Uuid::new_v4(), OWNER).await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_record_chunk_idempotent_and_conflict() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(10), Duration::hours(1))
            .await
            .unwrap();

        assert!(registry.record_chunk(session.id, record(session.id, 0, 5, "aa")).await.unwrap());
        assert!(!registry.record_chunk(session.id, record(session.id, 0, 5, "aa")).await.unwrap());
        assert!(matches!(
            registry.record_chunk(session.id, record(session.id, 0, 5, "bb")).await,
            Err(UploadError::PartConflict { part_number: 0, .. })
        ));

        let snapshot = registry.get(session.id, OWNER).await.unwrap();
        assert_eq!(snapshot.session.status, SessionStatus::Uploading);
        assert_eq!(snapshot.chunks.len(), 1);
        assert_eq!(snapshot.received_bytes, 5);
    }

    #[tokio::test]
    async fn test_list_chunks_sorted() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(30), Duration::hours(1))
            .await
            .unwrap();

        for part in [2, 0, 1] {
            registry
                .record_chunk(session.id, record(session.id, part, 10, &format!("h{}", part)))
                .await
                .unwrap();
        }

        let parts: Vec<u32> = registry
            .list_chunks(session.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.part_number)
            .collect();
        assert_eq!(parts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_concurrent_record_chunk() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(1000), Duration::hours(1))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for part in 0..50u32 {
            let registry = registry.clone();
            let id = session.id;
            tasks.push(tokio::spawn(async move {
                registry
                    .record_chunk(id, record(id, part, 20, &format!("h{}", part)))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }

        let snapshot = registry.get(session.id, OWNER).await.unwrap();
        assert_eq!(snapshot.chunks.len(), 50);
        assert_eq!(snapshot.received_bytes, 1000);
    }

    #[tokio::test]
    async fn test_mark_status_validates_transitions() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(10), Duration::hours(1))
            .await
            .unwrap();

        assert!(matches!(
            registry.mark_status(session.id, SessionStatus::Assembling).await,
            Err(UploadError::Conflict(_))
        ));
        assert!(matches!(
            registry.mark_status(session.id, SessionStatus::Completed).await,
            Err(UploadError::Conflict(_))
        ));

        registry.record_chunk(session.id, record(session.id, 0, 10, "aa")).await.unwrap();
        let updated = registry.mark_status(session.id, SessionStatus::Assembling).await.unwrap();
        assert_eq!(updated.status, SessionStatus::Assembling);

        // No expiry or cancel while assembling
        assert!(registry.mark_status(session.id, SessionStatus::Expired).await.is_err());
        assert!(matches!(
            registry.cancel(session.id, OWNER).await,
            Err(UploadError::AssemblyInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_lazy_expiry_reports_gone() {
        let (registry, clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(10), Duration::hours(1))
            .await
            .unwrap();

        clock.advance(Duration::hours(2));

        assert!(matches!(
            registry.get(session.id, OWNER).await,
            Err(UploadError::SessionGone { status: SessionStatus::Expired, .. })
        ));
        assert!(matches!(
            registry.record_chunk(session.id, record(session.id, 0, 10, "aa")).await,
            Err(UploadError::SessionGone { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_parts() {
        let (registry, _clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(40), Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(registry.lock(session.id).await.unwrap().missing_parts(), vec![0]);

        registry.record_chunk(session.id, record(session.id, 0, 10, "a")).await.unwrap();
        registry.record_chunk(session.id, record(session.id, 2, 10, "c")).await.unwrap();
        assert_eq!(registry.lock(session.id).await.unwrap().missing_parts(), vec![1]);

        registry.record_chunk(session.id, record(session.id, 1, 10, "b")).await.unwrap();
        assert_eq!(registry.lock(session.id).await.unwrap().missing_parts(), vec![3]);

        registry.record_chunk(session.id, record(session.id, 3, 10, "d")).await.unwrap();
        assert!(registry.lock(session.id).await.unwrap().missing_parts().is_empty());
    }

    #[tokio::test]
    async fn test_purged_expired_session_stays_gone() {
        let (registry, clock) = registry();
        let (session, _) = registry
            .create(OWNER, &create_test_request(10), Duration::hours(1))
            .await
            .unwrap();

        clock.advance(Duration::hours(2));
        assert!(registry.get(session.id, OWNER).await.is_err());
        assert!(registry.remove(session.id).await.is_some());

        assert!(matches!(
            registry.get(session.id, OWNER).await,
            Err(UploadError::SessionGone { status: SessionStatus::Expired, .. })
        ));
        assert!(matches!(
            registry.record_chunk(session.id, record(session.id, 0, 10, "aa")).await,
            Err(UploadError::SessionGone { .. })
        ));
        // Still hidden from other owners
        assert!(matches!(
            registry.get(session.id, "intruder").await,
            Err(UploadError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_pending_transfer() {
        let request = create_test_request(10);
        let mut state = SessionState::new(UploadSession::new(
            OWNER,
            &request,
            None,
            Utc::now(),
            Duration::hours(1),
        ));

        assert!(state.pending_transfer(0, "aa").unwrap().is_none());
        state.reserve(0, 5, "aa").unwrap();
        assert_eq!(state.staged_bytes(), 5);

        assert!(state.pending_transfer(0, "aa").unwrap().is_some());
        assert!(matches!(
            state.pending_transfer(0, "bb"),
            Err(UploadError::Conflict(_))
        ));
        assert!(matches!(state.reserve(0, 5, "aa"), Err(UploadError::Conflict(_))));

        state.release(0);
        assert!(state.pending_transfer(0, "aa").unwrap().is_none());
        assert_eq!(state.staged_bytes(), 0);
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let request = create_test_request(10);
        let mut state = SessionState::new(UploadSession::new(
            OWNER,
            &request,
            None,
            Utc::now(),
            Duration::hours(1),
        ));
        state.reserve(0, 5, "aa").unwrap();

        let done = state.pending_transfer(0, "aa").unwrap().unwrap();
        let notified = done.notified();
        state.release(0);

        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_clears_idempotency_key() {
        let (registry, _clock) = registry();
        let request = InitiateUploadRequest {
            idempotency_key: Some("k".to_string()),
            ..create_test_request(10)
        };
        let (session, _) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();

        assert!(registry.remove(session.id).await.is_some());
        assert!(registry.remove(session.id).await.is_none());

        let (fresh, created) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
        assert!(created);
        assert_ne!(fresh.id, session.id);
    }

    mod journaled {
        use super::*;
        use crate::storage::LocalObjectStore;
        use tempfile::TempDir;

        async fn journal(dir: &TempDir) -> SessionJournal {
            let store = LocalObjectStore::new(dir.path()).await.unwrap();
            SessionJournal::new(Arc::new(store))
        }

        #[tokio::test]
        async fn test_sessions_survive_reopen() {
            let dir = TempDir::new().unwrap();
            let clock = ManualClock::default();
            let registry =
                SessionRegistry::with_journal(Arc::new(clock.clone()), 1024, journal(&dir).await);

            let request = InitiateUploadRequest {
                idempotency_key: Some("resume".to_string()),
                ..create_test_request(10)
            };
            let (open, _) = registry.create(OWNER, &request, Duration::hours(1)).await.unwrap();
            registry.record_chunk(open.id, record(open.id, 0, 5, "aa")).await.unwrap();

            let (cancelled, _) = registry
                .create(OWNER, &create_test_request(10), Duration::hours(1))
                .await
                .unwrap();
            registry.cancel(cancelled.id, OWNER).await.unwrap();
            registry.remove(cancelled.id).await.unwrap();

            let reopened = SessionRegistry::open(Arc::new(clock.clone()), 1024, journal(&dir).await)
                .await
                .unwrap();

            let snapshot = reopened.get(open.id, OWNER).await.unwrap();
            assert_eq!(snapshot.session.status, SessionStatus::Uploading);
            assert_eq!(snapshot.chunks.len(), 1);
            assert_eq!(snapshot.received_bytes, 5);

            let (again, created) = reopened.create(OWNER, &request, Duration::hours(1)).await.unwrap();
            assert!(!created);
            assert_eq!(again.id, open.id);

            assert!(matches!(
                reopened.get(cancelled.id, OWNER).await,
                Err(UploadError::SessionGone { status: SessionStatus::Cancelled, .. })
            ));
        }

        #[tokio::test]
        async fn test_assembly_lease_is_not_restored() {
            let dir = TempDir::new().unwrap();
            let clock = ManualClock::default();
            let registry =
                SessionRegistry::with_journal(Arc::new(clock.clone()), 1024, journal(&dir).await);

            let (session, _) = registry
                .create(OWNER, &create_test_request(5), Duration::hours(1))
                .await
                .unwrap();
            registry.record_chunk(session.id, record(session.id, 0, 5, "aa")).await.unwrap();
            registry.mark_status(session.id, SessionStatus::Assembling).await.unwrap();

            let reopened = SessionRegistry::open(Arc::new(clock), 1024, journal(&dir).await)
                .await
                .unwrap();
            assert_eq!(
                reopened.lock(session.id).await.unwrap().status(),
                SessionStatus::Uploading
            );
        }

        #[tokio::test]
        async fn test_completed_purge_forgets_session() {
            let dir = TempDir::new().unwrap();
            let clock = ManualClock::default();
            let registry =
                SessionRegistry::with_journal(Arc::new(clock.clone()), 1024, journal(&dir).await);

            let (session, _) = registry
                .create_deduplicated(
                    OWNER,
                    &InitiateUploadRequest {
                        expected_sha256: Some("ab".repeat(32)),
                        ..create_test_request(5)
                    },
                    Duration::hours(1),
                    "objects/ab/key".to_string(),
                )
                .await
                .unwrap();
            assert_eq!(session.status, SessionStatus::Completed);
            assert!(session.deduplicated);

            registry.remove(session.id).await.unwrap();
            assert!(journal(&dir).await.load().await.unwrap().is_empty());
            assert!(matches!(
                registry.get(session.id, OWNER).await,
                Err(UploadError::SessionNotFound(_))
            ));
        }
    }
}
