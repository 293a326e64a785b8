//! HTTP authority route tests, driven through the router without a socket

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokenbus::auth::{AuthorityConfig, TokenAuthority, TokenKeys};
use tokenbus::broker::Broker;
use tokenbus::server::{create_router, AppState};
use tower::ServiceExt;

fn app() -> (Router, Arc<TokenAuthority>) {
    let authority = Arc::new(TokenAuthority::new(
        TokenKeys::generate(),
        AuthorityConfig::new(),
    ));
    let state = AppState::new(authority.clone(), Broker::new());
    (create_router(state), authority)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn login(app: &Router) -> (String, String) {
    let (status, body) = send(app, post_json("/login", json!({ "username": "service1" }))).await;
    assert_eq!(status, StatusCode::OK);
    (
        body["accessToken"].as_str().unwrap().to_string(),
        body["refreshToken"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn test_login_issues_pair() {
    let (app, authority) = app();

    let (status, body) = send(&app, post_json("/login", json!({ "username": "service1" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Login successful");

    let refresh = body["refreshToken"].as_str().unwrap();
    assert!(refresh.starts_with("rt-"));
    assert!(authority.is_active(refresh));
    assert!(body["accessToken"].as_str().unwrap().starts_with("at-"));
}

#[tokio::test]
async fn test_login_requires_username() {
    let (app, _) = app();

    let (status, body) = send(&app, post_json("/login", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Username required");

    let (status, _) = send(&app, post_json("/login", json!({ "username": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No body at all
    let request = Request::builder()
        .method("POST")
        .uri("/login")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_verify_bearer() {
    let (app, _) = app();
    let (access, _) = login(&app).await;

    let request = Request::builder()
        .method("POST")
        .uri("/verify")
        .header(header::AUTHORIZATION, format!("Bearer {}", access))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["subject"], "service1");

    let request = Request::builder()
        .method("POST")
        .uri("/verify")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Access token required");

    let request = Request::builder()
        .method("POST")
        .uri("/verify")
        .header(header::AUTHORIZATION, "Bearer at-forged.signature")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_refresh_and_logout() {
    let (app, authority) = app();
    let (_, refresh) = login(&app).await;

    let (status, body) = send(&app, post_json("/token", json!({ "refreshToken": refresh }))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["accessToken"].as_str().unwrap().starts_with("at-"));

    let (status, body) = send(&app, post_json("/token", json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Refresh token required");

    let (status, body) = send(&app, post_json("/logout", json!({ "refreshToken": refresh }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Logged out successfully");
    assert!(!authority.is_active(&refresh));

    // Revoked tokens are refused; logout stays idempotent
    let (status, _) = send(&app, post_json("/token", json!({ "refreshToken": refresh }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, post_json("/logout", json!({ "refreshToken": refresh }))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
