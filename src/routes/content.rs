//! Content Routes
//!
//! Streams persisted objects with HTTP partial-content semantics.
//!
//! - `GET /api/v1/content/:key` - whole object, or one range via `Range`
//! - `HEAD /api/v1/content/:key` - headers only

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::content::{ContentError, ResolvedObject, IMMUTABLE_CACHE_CONTROL};
use crate::state::AppState;

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for ContentError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Content request failed");
        }

        let mut headers = vec![(header::ACCEPT_RANGES, "bytes".to_string())];
        if let ContentError::RangeNotSatisfiable { size } = &self {
            headers.push((header::CONTENT_RANGE, format!("bytes */{}", size)));
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        with_headers((status, body).into_response(), headers)
    }
}

/// Create the content router
pub fn router() -> Router<AppState> {
    Router::new().route("/:key", get(get_content).head(head_content))
}

/// Headers shared by every successful response
fn object_headers(object: &ResolvedObject) -> Vec<(HeaderName, String)> {
    vec![
        (header::ETAG, object.etag()),
        (header::ACCEPT_RANGES, "bytes".to_string()),
        (header::CACHE_CONTROL, IMMUTABLE_CACHE_CONTROL.to_string()),
    ]
}

fn if_none_match_hits(headers: &HeaderMap, object: &ResolvedObject) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(|value| object.matches_etag(value))
        .unwrap_or(false)
}

fn respond(status: StatusCode, headers: Vec<(HeaderName, String)>, body: Body) -> Response {
    with_headers((status, body).into_response(), headers)
}

fn with_headers(mut response: Response, headers: Vec<(HeaderName, String)>) -> Response {
    for (name, value) in headers {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// GET /api/v1/content/:key
async fn get_content(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ContentError> {
    let object = state.content().resolve(&key).await?;

    if if_none_match_hits(&headers, &object) {
        return Ok(respond(StatusCode::NOT_MODIFIED, object_headers(&object), Body::empty()));
    }

    // A non-text Range header cannot be satisfied
    let range_header = match headers.get(header::RANGE) {
        Some(value) => Some(value.to_str().map_err(|_| ContentError::RangeNotSatisfiable {
            size: object.size,
        })?),
        None => None,
    };

    let content = state.content().open(&key, range_header).await?;

    let mut response_headers = object_headers(&content.object);
    response_headers.push((header::CONTENT_TYPE, "application/octet-stream".to_string()));
    response_headers.push((header::CONTENT_LENGTH, content.content_length().to_string()));

    let status = match content.range {
        Some(range) => {
            response_headers.push((header::CONTENT_RANGE, range.content_range(content.object.size)));
            tracing::info!(
                digest = %content.object.digest,
                range = %format!("{}-{}", range.start, range.end),
                size = range.len(),
                "Serving partial content"
            );
            StatusCode::PARTIAL_CONTENT
        }
        None => {
            tracing::info!(
                digest = %content.object.digest,
                size = content.object.size,
                "Serving full object"
            );
            StatusCode::OK
        }
    };

    Ok(respond(status, response_headers, Body::from_stream(content.stream)))
}

/// HEAD /api/v1/content/:key
async fn head_content(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ContentError> {
    let object = state.content().resolve(&key).await?;

    if if_none_match_hits(&headers, &object) {
        return Ok(respond(StatusCode::NOT_MODIFIED, object_headers(&object), Body::empty()));
    }

    let mut response_headers = object_headers(&object);
    response_headers.push((header::CONTENT_TYPE, "application/octet-stream".to_string()));
    response_headers.push((header::CONTENT_LENGTH, object.size.to_string()));

    tracing::debug!(digest = %object.digest, size = object.size, "HEAD request");

    Ok(respond(StatusCode::OK, response_headers, Body::empty()))
}
