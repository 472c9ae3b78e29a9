//! Router-level tests that never reach the database
#![allow(clippy::unwrap_used)]

mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
};
use linedesk_api::routes::create_router;
use tower::ServiceExt;

async fn send(request: Request<Body>) -> (StatusCode, String) {
    let app = create_router(common::lazy_state());
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn test_liveness_returns_ok() {
    let (status, _) = send(
        Request::get("/health/live")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_protected_route_requires_token() {
    let (status, _) = send(Request::get("/api/v1/tickets").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_protected_route_rejects_garbage_token() {
    let (status, _) = send(
        Request::get("/api/v1/clients")
            .header(header::AUTHORIZATION, "Bearer not.a.jwt")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_pbx_webhook_requires_token() {
    let (status, _) = send(
        Request::post("/api/v1/webhooks/pbx")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"event":"ringing","call_id":"1","from":"+79990000000"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_whatsapp_verify_echoes_challenge() {
    let uri = format!(
        "/api/v1/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token={}&hub.challenge=1158201444",
        common::VERIFY_TOKEN
    );
    let (status, body) = send(Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1158201444");
}

#[tokio::test]
async fn test_whatsapp_verify_rejects_wrong_token() {
    let (status, _) = send(
        Request::get("/api/v1/webhooks/whatsapp?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_whatsapp_event_rejects_bad_signature() {
    let (status, _) = send(
        Request::post("/api/v1/webhooks/whatsapp")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-hub-signature-256", "sha256=deadbeef")
            .body(Body::from(r#"{"object":"whatsapp_business_account","entry":[]}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let (status, _) = send(Request::get("/api/v1/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
