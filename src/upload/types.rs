//! Upload types for the chunked upload protocol

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

// ============================================================================
// Constants
// ============================================================================

/// Session expiry time: 24 hours
pub const SESSION_TTL_HOURS: i64 = 24;

/// Maximum single chunk size: 10MB. Also the staging slack over the declared size.
pub const MAX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Maximum file size: 500MB
pub const MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Maximum time to receive and stage one chunk
pub const CHUNK_TRANSFER_TIMEOUT_SECS: u64 = 120;

/// Reaper sweep interval: 5 minutes
pub const REAPER_INTERVAL_SECS: u64 = 300;

/// Terminal session records are kept this long before being compacted
pub const TERMINAL_RETENTION_DAYS: i64 = 7;

pub const METADATA_CACHE_TTL_SECS: i64 = 600;
pub const METADATA_CACHE_CAPACITY: usize = 1024;

/// Header carrying the caller-declared chunk digest
pub const CHUNK_HASH_HEADER: &str = "x-chunk-sha256";

// ============================================================================
// Initiation Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Optional SHA-256 of the complete file, checked after assembly
    #[serde(default)]
    pub expected_sha256: Option<String>,

    /// Optional client key; repeating it returns the same open session
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Response to an initiation request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub upload_id: Uuid,
    pub status: SessionStatus,
    pub max_chunk_size: u64,
    pub expires_at: DateTime<Utc>,
    /// Set when the expected object was already stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
}

// ============================================================================
// Chunk Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub part_number: u32,
    pub size: u64,
    pub hash: String,
    /// Number of parts recorded so far
    pub chunks_received: usize,
    /// The identical part had already been recorded
    pub duplicate: bool,
}

/// Status of a single part
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatus {
    pub part_number: u32,
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl ChunkStatus {
    pub fn not_uploaded(part_number: u32) -> Self {
        Self {
            part_number,
            received: false,
            size: None,
            hash: None,
            received_at: None,
        }
    }
}

/// A verified, staged part of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub session_id: Uuid,
    pub part_number: u32,
    pub byte_size: u64,
    pub content_hash: String,
    pub received_at: DateTime<Utc>,
}

// ============================================================================
// Completion Types
// ============================================================================

/// Result of a successful assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub upload_id: Uuid,
    /// Key of the content-addressed object
    pub storage_key: String,
    /// SHA-256 of the assembled object
    pub checksum: String,
    pub size: u64,
    /// An object with this digest already existed and was reused
    pub deduplicated: bool,
    pub completed_at: DateTime<Utc>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Authenticated owner supplied by the identity layer
    pub owner_id: String,

    pub declared_file_name: String,
    pub declared_total_size: u64,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    pub status: SessionStatus,

    pub completed_at: Option<DateTime<Utc>>,
    pub final_storage_key: Option<String>,
    pub final_checksum: Option<String>,

    /// Caller-declared whole-file digest
    pub expected_checksum: Option<String>,
    pub idempotency_key: Option<String>,

    /// Set when the final object reused an existing one
    #[serde(default)]
    pub deduplicated: bool,
}

impl UploadSession {
    pub fn new(
        owner_id: &str,
        request: &InitiateUploadRequest,
        expected_checksum: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            declared_file_name: request.file_name.clone(),
            declared_total_size: request.total_size,
            created_at: now,
            expires_at: now + ttl,
            status: SessionStatus::Initiated,
            completed_at: None,
            final_storage_key: None,
            final_checksum: None,
            expected_checksum,
            idempotency_key: request.idempotency_key.clone(),
            deduplicated: false,
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Result of the assembly, if the session completed
    pub fn completed_upload(&self) -> Option<CompletedUpload> {
        match (
            self.status,
            &self.final_storage_key,
            &self.final_checksum,
            self.completed_at,
        ) {
            (SessionStatus::Completed, Some(key), Some(checksum), Some(completed_at)) => {
                Some(CompletedUpload {
                    upload_id: self.id,
                    storage_key: key.clone(),
                    checksum: checksum.clone(),
                    size: self.declared_total_size,
                    deduplicated: self.deduplicated,
                    completed_at,
                })
            }
            _ => None,
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Created, no chunk accepted yet
    Initiated,
    /// Receiving chunks
    Uploading,
    /// Holding the assembly lease
    Assembling,
    /// Object persisted
    Completed,
    /// Whole-object integrity mismatch
    Failed,
    /// Reclaimed after its TTL
    Expired,
    /// Cancelled by its owner
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }

    /// Whether the session can still accept chunks
    pub fn is_open(self) -> bool {
        matches!(self, Self::Initiated | Self::Uploading)
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Initiated, Uploading)
                | (Uploading, Assembling)
                | (Assembling, Completed)
                | (Assembling, Failed)
                | (Assembling, Uploading)
                | (Initiated, Expired)
                | (Uploading, Expired)
                | (Initiated, Cancelled)
                | (Uploading, Cancelled)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Uploading => "uploading",
            Self::Assembling => "assembling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Session together with its chunk manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: UploadSession,
    /// Recorded parts, ascending by part number
    pub chunks: Vec<ChunkRecord>,
    pub received_bytes: u64,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Missing owner identity")]
    MissingOwner,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {id} is no longer active ({status})")]
    SessionGone { id: Uuid, status: SessionStatus },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Assembly already in progress for session {0}")]
    AssemblyInProgress(Uuid),

    #[error("Part {part_number} already recorded with hash {existing}, received {received}")]
    PartConflict {
        part_number: u32,
        existing: String,
        received: String,
    },

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("Object integrity check failed: {0}")]
    ObjectIntegrity(String),

    #[error("Upload incomplete: missing parts {missing:?}")]
    IncompleteUpload {
        missing: Vec<u32>,
        received_bytes: u64,
        declared_bytes: u64,
    },

    #[error("Staging budget exceeded: {attempted} bytes (limit: {limit})")]
    Backpressure { attempted: u64, limit: u64 },

    #[error("Chunk transfer timed out after {0} seconds")]
    TransferTimeout(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::MissingOwner => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionGone { .. } => StatusCode::GONE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AssemblyInProgress(_) => StatusCode::CONFLICT,
            Self::PartConflict { .. } => StatusCode::CONFLICT,
            Self::ChunkHashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ObjectIntegrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::Backpressure { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TransferTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::Storage(StorageError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::MissingOwner => "MISSING_OWNER",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionGone { .. } => "SESSION_GONE",
            Self::Conflict(_) => "CONFLICT",
            Self::AssemblyInProgress(_) => "ASSEMBLY_IN_PROGRESS",
            Self::PartConflict { .. } => "PART_CONFLICT",
            Self::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::ObjectIntegrity(_) => "OBJECT_INTEGRITY_FAILED",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::Backpressure { .. } => "BACKPRESSURE",
            Self::TransferTimeout(_) => "TRANSFER_TIMEOUT",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
