//! Session Journal
//!
//! Durable copy of every session and its chunk manifest, kept as one JSON
//! document per session at `sessions/<upload_id>.json` in the object store.
//! Staged chunk bytes are already durable; the journal makes their manifest
//! durable too, so a restarted server resumes open uploads.
//!
//! Purged sessions that must keep answering Gone are rewritten as compact
//! tombstones instead of being deleted.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::storage::ObjectStore;

use super::types::{ChunkRecord, SessionStatus, UploadSession};

/// Prefix under which session documents live
pub const JOURNAL_PREFIX: &str = "sessions/";

/// Persisted form of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session: UploadSession,
    /// Recorded parts, ascending by part number
    pub chunks: Vec<ChunkRecord>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub staging_reclaimed: bool,
}

/// What remains of an expired or cancelled session after its record is purged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub id: Uuid,
    pub owner_id: String,
    pub status: SessionStatus,
}

/// One journal document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JournalEntry {
    Session(SessionRecord),
    Tombstone(Tombstone),
}

impl JournalEntry {
    pub fn id(&self) -> Uuid {
        match self {
            JournalEntry::Session(record) => record.session.id,
            JournalEntry::Tombstone(tombstone) => tombstone.id,
        }
    }
}

/// Reads and writes session documents
#[derive(Clone)]
pub struct SessionJournal {
    store: Arc<dyn ObjectStore>,
}

impl SessionJournal {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn key(id: Uuid) -> String {
        format!("{}{}.json", JOURNAL_PREFIX, id)
    }

    /// Replace the document of a session
    pub async fn save(&self, entry: &JournalEntry) -> StorageResult<()> {
        let data = serde_json::to_vec(entry)?;
        self.store.put(&Self::key(entry.id()), Bytes::from(data)).await
    }

    /// Forget a session entirely
    pub async fn remove(&self, id: Uuid) -> StorageResult<()> {
        match self.store.delete(&Self::key(id)).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Every readable document. Unreadable ones are logged and skipped.
    pub async fn load(&self) -> StorageResult<Vec<JournalEntry>> {
        let mut entries = Vec::new();

        for key in self.store.list(JOURNAL_PREFIX).await? {
            if !key.ends_with(".json") {
                continue;
            }

            let data = match self.store.get(&key).await {
                Ok(data) => data,
                // Removed since listing
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };

            match serde_json::from_slice::<JournalEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable session document");
                }
            }
        }

        tracing::debug!(sessions = entries.len(), "Loaded session journal");
        Ok(entries)
    }
}
