//! Shared helpers for HTTP tests.
//! Note: #[allow(dead_code)] because each test file compiles common/ separately.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use bookvault::clock::ManualClock;
use bookvault::storage::{content_key, LocalObjectStore, ObjectStore};
use bookvault::upload::compute_hash;
use bookvault::{routes, AppState, Config};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

pub const OWNER: &str = "reader-1";

/// Router wired to a temporary local store and a manual clock
#[allow(dead_code)]
pub struct TestApp {
    pub router: axum::Router,
    pub state: AppState,
    pub store: Arc<LocalObjectStore>,
    pub clock: ManualClock,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        Self::over(temp_dir, ManualClock::default()).await
    }

    async fn over(temp_dir: TempDir, clock: ManualClock) -> Self {
        let store = Arc::new(
            LocalObjectStore::new(temp_dir.path())
                .await
                .expect("Failed to create storage backend"),
        );

        let state = AppState::open(Config::default(), store.clone(), Arc::new(clock.clone()))
            .await
            .expect("Failed to open state");
        let router = routes::app(state.clone());

        Self {
            router,
            state,
            store,
            clock,
            _temp_dir: temp_dir,
        }
    }

    /// Simulate a server restart: fresh state over the same storage and clock
    pub async fn restart(self) -> Self {
        let TestApp {
            clock, _temp_dir, ..
        } = self;
        Self::over(_temp_dir, clock).await
    }

    /// Persist an object directly, returning its digest
    pub async fn put_object(&self, data: Vec<u8>) -> String {
        let digest = compute_hash(&data);
        self.store
            .put(&content_key(&digest), Bytes::from(data))
            .await
            .expect("Failed to store object");
        digest
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    /// Initiate an upload as [`OWNER`], returning its id
    pub async fn initiate(&self, total_size: u64) -> String {
        let response = self
            .send(json_request(
                "POST",
                "/api/v1/uploads",
                serde_json::json!({ "fileName": "book.epub", "totalSize": total_size }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::CREATED);
        response.json()["uploadId"].as_str().unwrap().to_string()
    }

    pub async fn put_part(&self, upload_id: &str, part: u32, data: &[u8], hash: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/uploads/{}/parts/{}", upload_id, part))
            .header("x-owner-id", OWNER);
        if let Some(hash) = hash {
            builder = builder.header("x-chunk-sha256", hash);
        }
        self.send(builder.body(Body::from(data.to_vec())).unwrap()).await
    }
}

#[allow(dead_code)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[allow(dead_code)]
impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// JSON request as [`OWNER`]
#[allow(dead_code)]
pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-owner-id", OWNER)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// Body-less request as [`OWNER`]
#[allow(dead_code)]
pub fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-owner-id", OWNER)
        .body(Body::empty())
        .unwrap()
}
