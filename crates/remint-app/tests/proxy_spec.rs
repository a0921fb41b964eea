//! Egress gateway contract: parameter rules, same-origin policy, header
//! stamping, and upstream status mirroring against a mock storage origin.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

use common::{ScriptedImage, ScriptedReply, SharedBlobStore, StubImageModel, StubPromptModel};
use remint_app::pipeline::PromptOutcome;
use remint_app::server::build_router;

const OBJECT_KEY: &str = "internaluse/inputs/3f2c8a74-aaaa-bbbb-cccc-000000000000.png";
const OBJECT_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-image-bytes";

async fn storage_origin() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{OBJECT_KEY}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(OBJECT_BYTES)
                .insert_header("content-type", "image/png"),
        )
        .mount(&server)
        .await;
    server
}

fn router_for(base_url: &str) -> axum::Router {
    let state = common::test_state(
        SharedBlobStore::new(base_url),
        StubPromptModel {
            stage1: ScriptedReply::Outcome(PromptOutcome::generated("unused")),
            stage2: None,
        },
        StubImageModel::new(ScriptedImage::Bytes(b"unused")),
        base_url,
    );
    build_router(state)
}

async fn get(router: axum::Router, uri: &str) -> axum::response::Response {
    router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("proxy responds")
}

#[tokio::test]
async fn key_lookup_streams_bytes_with_cache_headers() {
    let origin = storage_origin().await;
    let base = format!("{}/", origin.uri());
    let router = router_for(&base);

    let response = get(router, &format!("/api/image-proxy?key={OBJECT_KEY}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("content-type").unwrap(), "image/png");
    assert_eq!(
        headers.get("cache-control").unwrap(),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), OBJECT_BYTES);
}

#[tokio::test]
async fn key_and_url_requests_return_identical_bytes() {
    let origin = storage_origin().await;
    let base = format!("{}/", origin.uri());

    let by_key = get(
        router_for(&base),
        &format!("/api/image-proxy?key={OBJECT_KEY}"),
    )
    .await;
    let by_url = get(
        router_for(&base),
        &format!("/api/image-proxy?url={base}{OBJECT_KEY}"),
    )
    .await;

    assert_eq!(by_key.status(), StatusCode::OK);
    assert_eq!(by_url.status(), StatusCode::OK);

    let key_bytes = by_key.into_body().collect().await.unwrap().to_bytes();
    let url_bytes = by_url.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(key_bytes, url_bytes);
}

#[tokio::test]
async fn foreign_origin_url_is_forbidden() {
    let origin = storage_origin().await;
    let base = format!("{}/", origin.uri());
    let router = router_for(&base);

    let response = get(
        router,
        "/api/image-proxy?url=https://evil.example.com/internaluse/inputs/x.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("structured JSON error");
    assert!(value.get("error").is_some());
}

#[tokio::test]
async fn missing_and_duplicate_parameters_are_rejected() {
    let origin = storage_origin().await;
    let base = format!("{}/", origin.uri());

    let none = get(router_for(&base), "/api/image-proxy").await;
    assert_eq!(none.status(), StatusCode::BAD_REQUEST);

    let both = get(
        router_for(&base),
        &format!("/api/image-proxy?key={OBJECT_KEY}&url={base}{OBJECT_KEY}"),
    )
    .await;
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upstream_status_is_mirrored() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/internaluse/inputs/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&origin)
        .await;

    let base = format!("{}/", origin.uri());
    let response = get(
        router_for(&base),
        "/api/image-proxy?key=internaluse/inputs/missing.png",
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("structured JSON error");
    assert!(
        value["error"].as_str().unwrap().contains("404"),
        "error body names the upstream status"
    );
}
