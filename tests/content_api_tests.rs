//! HTTP tests for byte-range content serving

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::TestApp;

fn sample(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn get(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_full_object() {
    let app = TestApp::new().await;
    let data = sample(1000);
    let digest = app.put_object(data.clone()).await;

    let response = app.send(get(&format!("/api/v1/content/{}", digest), &[])).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body.as_ref(), data.as_slice());
    assert_eq!(response.header("content-length"), Some("1000"));
    assert_eq!(response.header("accept-ranges"), Some("bytes"));
    assert_eq!(response.header("etag"), Some(format!("\"{}\"", digest).as_str()));
    assert!(response.header("cache-control").unwrap().contains("immutable"));
    assert!(response.header("content-range").is_none());
}

#[tokio::test]
async fn test_partial_content() {
    let app = TestApp::new().await;
    let data = sample(1000);
    let digest = app.put_object(data.clone()).await;
    let uri = format!("/api/v1/content/{}", digest);

    let response = app.send(get(&uri, &[("range", "bytes=0-99")])).await;
    assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.body.as_ref(), &data[..100]);
    assert_eq!(response.header("content-range"), Some("bytes 0-99/1000"));
    assert_eq!(response.header("content-length"), Some("100"));

    let open_ended = app.send(get(&uri, &[("range", "bytes=900-")])).await;
    assert_eq!(open_ended.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(open_ended.body.as_ref(), &data[900..]);
    assert_eq!(open_ended.header("content-range"), Some("bytes 900-999/1000"));

    let suffix = app.send(get(&uri, &[("range", "bytes=-10")])).await;
    assert_eq!(suffix.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(suffix.body.as_ref(), &data[990..]);
}

#[tokio::test]
async fn test_unsatisfiable_ranges() {
    let app = TestApp::new().await;
    let digest = app.put_object(sample(1000)).await;
    let uri = format!("/api/v1/content/{}", digest);

    for range in ["bytes=1000-", "bytes=995-5000", "bytes=500-100", "bytes=0-10,20-30", "pages=1-2"] {
        let response = app.send(get(&uri, &[("range", range)])).await;
        assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE, "{}", range);
        assert_eq!(response.header("content-range"), Some("bytes */1000"), "{}", range);
    }
}

#[tokio::test]
async fn test_conditional_request() {
    let app = TestApp::new().await;
    let digest = app.put_object(sample(64)).await;
    let uri = format!("/api/v1/content/{}", digest);
    let etag = format!("\"{}\"", digest);

    let response = app.send(get(&uri, &[("if-none-match", etag.as_str())])).await;
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert!(response.body.is_empty());
    assert_eq!(response.header("etag"), Some(etag.as_str()));

    let stale = app.send(get(&uri, &[("if-none-match", "\"other\"")])).await;
    assert_eq!(stale.status, StatusCode::OK);
}

#[tokio::test]
async fn test_head_request() {
    let app = TestApp::new().await;
    let digest = app.put_object(sample(1000)).await;

    let response = app
        .send(
            Request::builder()
                .method("HEAD")
                .uri(format!("/api/v1/content/{}", digest))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.body.is_empty());
    assert_eq!(response.header("content-length"), Some("1000"));
    assert_eq!(response.header("accept-ranges"), Some("bytes"));
}

#[tokio::test]
async fn test_bad_and_missing_keys() {
    let app = TestApp::new().await;

    let invalid = app.send(get("/api/v1/content/not-a-digest", &[])).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);
    assert_eq!(invalid.json()["code"], "INVALID_KEY");

    let missing = app
        .send(get(&format!("/api/v1/content/{}", "a".repeat(64)), &[]))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}
