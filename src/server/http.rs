//! Token authority HTTP routes

use super::AppState;
use crate::error::AuthError;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

/// An error response: `{ "error": "..." }`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthError::InvalidOrExpired | AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LoginRequest {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshRequest {
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoginResponse {
    access_token: String,
    refresh_token: String,
    message: &'static str,
}

pub(crate) async fn login(
    State(state): State<AppState>,
    body: Option<Json<LoginRequest>>,
) -> Result<Json<LoginResponse>, ApiError> {
    let username = body
        .and_then(|Json(req)| req.username)
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "Username required"))?;

    let pair = state
        .authority
        .login(&username)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(subject = %username, "Issued credential pair");

    Ok(Json(LoginResponse {
        access_token: pair.access.into_string(),
        refresh_token: pair.refresh.into_string(),
        message: "Login successful",
    }))
}

pub(crate) async fn token(
    State(state): State<AppState>,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let refresh_token = refresh_token_of(body)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Refresh token required"))?;

    let access = state.authority.refresh(&refresh_token)?;
    debug!(subject = %access.subject(), "Access token refreshed");

    Ok(Json(json!({ "accessToken": access.as_str() })))
}

pub(crate) async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Access token required"))?;

    let subject = state.authority.verify_access(token)?;

    Ok(Json(json!({ "valid": true, "subject": subject })))
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    body: Option<Json<RefreshRequest>>,
) -> Json<serde_json::Value> {
    if let Some(refresh_token) = refresh_token_of(body) {
        state.authority.revoke(&refresh_token);
    }

    Json(json!({ "message": "Logged out successfully" }))
}

pub(crate) async fn health() -> &'static str {
    "ok"
}

fn refresh_token_of(body: Option<Json<RefreshRequest>>) -> Option<String> {
    body.and_then(|Json(req)| req.refresh_token)
        .filter(|t| !t.is_empty())
}

/// Extract the token from `Authorization: Bearer <token>`
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
