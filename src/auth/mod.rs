//! Credential lifecycle
//!
//! Token types:
//! - `at-` prefix: Access tokens (short-lived, verified on every publish and consume)
//! - `rt-` prefix: Refresh tokens (long-lived, revocable, tracked in the active set)
//!
//! `TokenAuthority` is the in-process authority. Remote authorities implement
//! the same `Authority` trait (see `tokenbus-client`).

mod authority;
mod clock;
mod tokens;

pub use authority::{AuthorityConfig, TokenAuthority, TokenPair};
pub use clock::{Clock, ManualClock, SystemClock};
pub use tokens::{
    inspect, AccessToken, RefreshToken, SigningKey, TokenClaims, TokenError, TokenKeys, TokenKind,
    ACCESS_TOKEN_PREFIX, REFRESH_TOKEN_PREFIX,
};

use crate::error::AuthError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A credential pair in its wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

/// The operations producers and consumers need from a credential authority
#[async_trait]
pub trait Authority: Send + Sync {
    /// Issue a fresh credential pair for `subject`
    async fn login(&self, subject: &str) -> Result<Credentials, AuthError>;

    /// Check an access token and return its subject
    async fn verify(&self, access_token: &str) -> Result<String, AuthError>;

    /// Exchange a live refresh token for a new access token
    async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError>;

    /// Revoke a refresh token (idempotent)
    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError>;
}
