//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol. Every route requires the
//! authenticated owner in the `X-Owner-Id` header.
//!
//! Endpoints:
//! - POST /api/v1/uploads - Initiate an upload session
//! - GET /api/v1/uploads/:upload_id - Session and chunk manifest
//! - DELETE /api/v1/uploads/:upload_id - Cancel an upload
//! - PUT /api/v1/uploads/:upload_id/parts/:part_number - Upload a chunk
//! - GET /api/v1/uploads/:upload_id/parts/:part_number - Chunk status
//! - POST /api/v1/uploads/:upload_id/complete - Assemble and store the file

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::state::AppState;
use crate::upload::{
    ChunkReceipt, ChunkStatus, CompletedUpload, InitiateUploadRequest, InitiateUploadResponse,
    SessionSnapshot, UploadError, CHUNK_HASH_HEADER,
};

/// Header carrying the authenticated owner
pub const OWNER_HEADER: &str = "x-owner-id";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_parts: Option<Vec<u32>>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let missing_parts = match &self {
            UploadError::IncompleteUpload { missing, .. } => Some(missing.clone()),
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
            missing_parts,
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Owner Extraction
// ============================================================================

/// Owner supplied by the identity layer in front of this service
#[derive(Debug, Clone)]
pub struct OwnerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = UploadError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|owner| !owner.is_empty())
            .map(|owner| OwnerId(owner.to_string()))
            .ok_or(UploadError::MissingOwner)
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(initiate))
        .route("/:upload_id", get(get_session).delete(cancel_session))
        .route(
            "/:upload_id/parts/:part_number",
            get(chunk_status).put(upload_chunk),
        )
        .route("/:upload_id/complete", post(complete))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads
///
/// Initiate an upload. Repeating an idempotency key returns the open session.
/// A session whose expected object is already stored comes back completed.
async fn initiate(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    body: Bytes,
) -> Result<(StatusCode, Json<InitiateUploadResponse>), UploadError> {
    let request: InitiateUploadRequest = serde_json::from_slice(&body)
        .map_err(|e| UploadError::Validation(format!("invalid request body: {}", e)))?;

    let (response, created) = state.uploads().initiate(&owner, &request).await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// GET /api/v1/uploads/:upload_id
async fn get_session(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(upload_id): Path<String>,
) -> Result<Json<SessionSnapshot>, UploadError> {
    let id = parse_upload_id(&upload_id)?;
    let snapshot = state.uploads().session(id, &owner).await?;
    Ok(Json(snapshot))
}

/// DELETE /api/v1/uploads/:upload_id
async fn cancel_session(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    let id = parse_upload_id(&upload_id)?;
    state.uploads().cancel(id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/uploads/:upload_id/parts/:part_number
///
/// Upload a single chunk. The chunk data is the raw request body; an
/// optional `X-Chunk-Sha256` header is checked against it.
async fn upload_chunk(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path((upload_id, part_number)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChunkReceipt>, UploadError> {
    let id = parse_upload_id(&upload_id)?;
    let part_number = parse_part_number(&part_number)?;

    let declared_hash = headers
        .get(CHUNK_HASH_HEADER)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| UploadError::Validation("chunk hash header is not valid text".to_string()))
        })
        .transpose()?;

    let limits = state.uploads().limits();
    let max_chunk = limits.max_chunk_size;

    // One deadline covers receiving the body and staging it
    let deadline = tokio::time::Instant::now() + limits.chunk_transfer_timeout;

    let data = match tokio::time::timeout_at(deadline, axum::body::to_bytes(body, max_chunk as usize)).await {
        Ok(Ok(data)) => data,
        Ok(Err(_)) => {
            let attempted = headers
                .get(header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(max_chunk + 1);
            return Err(UploadError::Backpressure {
                attempted,
                limit: max_chunk,
            });
        }
        Err(_) => {
            tracing::warn!(session_id = %id, part_number = part_number, "Chunk body not received in time");
            return Err(UploadError::TransferTimeout(
                limits.chunk_transfer_timeout.as_secs(),
            ));
        }
    };

    let receipt = state
        .uploads()
        .upload_chunk_until(id, &owner, part_number, data, declared_hash, deadline)
        .await?;

    Ok(Json(receipt))
}

/// GET /api/v1/uploads/:upload_id/parts/:part_number
async fn chunk_status(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path((upload_id, part_number)): Path<(String, String)>,
) -> Result<Json<ChunkStatus>, UploadError> {
    let id = parse_upload_id(&upload_id)?;
    let part_number = parse_part_number(&part_number)?;
    let status = state.uploads().chunk_status(id, &owner, part_number).await?;
    Ok(Json(status))
}

/// POST /api/v1/uploads/:upload_id/complete
///
/// Assemble the chunks and store the final object.
async fn complete(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(upload_id): Path<String>,
) -> Result<(StatusCode, Json<CompletedUpload>), UploadError> {
    let id = parse_upload_id(&upload_id)?;
    let completed = state.uploads().complete(id, &owner).await?;
    Ok((StatusCode::CREATED, Json(completed)))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_upload_id(upload_id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(upload_id)
        .map_err(|_| UploadError::Validation(format!("invalid upload id: {}", upload_id)))
}

fn parse_part_number(part_number: &str) -> Result<u32, UploadError> {
    part_number
        .parse()
        .map_err(|_| UploadError::Validation(format!("invalid part number: {}", part_number)))
}
