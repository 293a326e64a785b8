//! Token authority over HTTP

use crate::error::ClientError;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokenbus::auth::{Authority, Credentials};
use tokenbus::error::AuthError;
use tracing::debug;

/// Talks to a `tokenbus serve` authority (`/login`, `/verify`, `/token`, `/logout`)
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct VerifyResponse {
    subject: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "authority url must start with http:// or https://: {}",
                base_url
            )));
        }

        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Transport failures mean the authority could not answer
fn unreachable(err: reqwest::Error) -> AuthError {
    AuthError::Unreachable(err.to_string())
}

/// Map a non-success status; anything that is not an explicit rejection is
/// treated as the authority being unavailable
fn rejection(status: StatusCode, forbidden: AuthError) -> AuthError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => AuthError::Unauthenticated,
        StatusCode::FORBIDDEN => forbidden,
        other => AuthError::Unreachable(format!("authority responded {}", other)),
    }
}

async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, AuthError> {
    response
        .json::<T>()
        .await
        .map_err(|e| AuthError::Unreachable(format!("unexpected authority response: {}", e)))
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn login(&self, subject: &str) -> Result<Credentials, AuthError> {
        let response = self
            .http
            .post(self.url("/login"))
            .json(&json!({ "username": subject }))
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(rejection(response.status(), AuthError::Unauthenticated));
        }

        debug!(subject, "Logged in");
        parse(response).await
    }

    async fn verify(&self, access_token: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(self.url("/verify"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(rejection(response.status(), AuthError::InvalidOrExpired));
        }

        let body: VerifyResponse = parse(response).await?;
        Ok(body.subject)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        let response = self
            .http
            .post(self.url("/token"))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(rejection(response.status(), AuthError::Forbidden));
        }

        let body: TokenResponse = parse(response).await?;
        Ok(body.access_token)
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(self.url("/logout"))
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(unreachable)?;

        if !response.status().is_success() {
            return Err(rejection(response.status(), AuthError::Forbidden));
        }
        Ok(())
    }
}
