//! The token authority: issues, verifies, refreshes and revokes credentials
//!
//! The authority is the only holder of shared mutable state in the pipeline:
//! the set of live refresh tokens. All access to it goes through
//! `login` / `refresh` / `revoke` (and `purge_expired` for housekeeping).

use crate::auth::clock::{Clock, SystemClock};
use crate::auth::tokens::{AccessToken, RefreshToken, TokenKeys};
use crate::auth::{Authority, Credentials};
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Token lifetimes
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl AuthorityConfig {
    pub fn new() -> Self {
        Self {
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }
    }

    pub fn access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    pub fn refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A freshly issued credential pair
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

impl From<TokenPair> for Credentials {
    fn from(pair: TokenPair) -> Self {
        Credentials {
            access_token: pair.access.into_string(),
            refresh_token: pair.refresh.into_string(),
        }
    }
}

/// Entry in the active-refresh set
#[derive(Debug, Clone)]
struct ActiveRefresh {
    subject: String,
    expires_at: DateTime<Utc>,
}

/// Issues and checks bearer credentials
pub struct TokenAuthority {
    keys: TokenKeys,
    config: AuthorityConfig,
    clock: Arc<dyn Clock>,
    /// Refresh token id -> liveness. Absent means revoked (or never issued).
    active_refresh: DashMap<Uuid, ActiveRefresh>,
}

impl TokenAuthority {
    pub fn new(keys: TokenKeys, config: AuthorityConfig) -> Self {
        Self::with_clock(keys, config, Arc::new(SystemClock))
    }

    pub fn with_clock(keys: TokenKeys, config: AuthorityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            keys,
            config,
            clock,
            active_refresh: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Issue a fresh pair for `subject` and register the refresh token
    pub fn login(&self, subject: &str) -> Result<TokenPair, AuthError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let now = self.clock.now();
        let access = AccessToken::issue(subject, now, self.config.access_ttl, &self.keys.access);
        let refresh = RefreshToken::issue(subject, now, self.config.refresh_ttl, &self.keys.refresh);

        self.active_refresh.insert(
            refresh.id(),
            ActiveRefresh {
                subject: subject.to_string(),
                expires_at: refresh.expires_at(),
            },
        );

        info!(subject = subject, refresh_id = %refresh.id(), "Issued credential pair");
        Ok(TokenPair { access, refresh })
    }

    /// Check an access token, returning its subject
    pub fn verify_access(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        match AccessToken::verify(token, &self.keys.access, self.clock.now()) {
            Ok(access) => Ok(access.subject().to_string()),
            Err(e) => {
                debug!(error = %e, "Access token rejected");
                Err(AuthError::InvalidOrExpired)
            }
        }
    }

    /// Mint a new access token from a live refresh token
    ///
    /// Non-consuming: the refresh token stays valid afterwards.
    pub fn refresh(&self, token: &str) -> Result<AccessToken, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        let now = self.clock.now();
        let refresh = RefreshToken::verify(token, &self.keys.refresh, now).map_err(|e| {
            debug!(error = %e, "Refresh token rejected");
            AuthError::Forbidden
        })?;

        if !self.active_refresh.contains_key(&refresh.id()) {
            debug!(refresh_id = %refresh.id(), "Refresh token not in active set");
            return Err(AuthError::Forbidden);
        }

        let access = AccessToken::issue(
            refresh.subject(),
            now,
            self.config.access_ttl,
            &self.keys.access,
        );

        debug!(subject = refresh.subject(), "Refreshed access token");
        Ok(access)
    }

    /// Remove a refresh token from the active set
    ///
    /// Unknown, already revoked, or undecodable tokens are a no-op.
    /// Expiry is ignored, but the signature must verify.
    pub fn revoke(&self, token: &str) {
        let Ok(refresh) = RefreshToken::parse(token, &self.keys.refresh) else {
            return;
        };

        if let Some((id, entry)) = self.active_refresh.remove(&refresh.id()) {
            info!(subject = %entry.subject, refresh_id = %id, "Revoked refresh token");
        }
    }

    /// Whether a refresh token is currently in the active set
    pub fn is_active(&self, token: &str) -> bool {
        RefreshToken::parse(token, &self.keys.refresh)
            .map(|r| self.active_refresh.contains_key(&r.id()))
            .unwrap_or(false)
    }

    /// Number of live refresh tokens
    pub fn active_count(&self) -> usize {
        self.active_refresh.len()
    }

    /// Drop entries whose refresh token has already expired
    ///
    /// Expired tokens fail `refresh` regardless, so this never changes an outcome.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.active_refresh.len();
        self.active_refresh.retain(|_, entry| now < entry.expires_at);
        let purged = before.saturating_sub(self.active_refresh.len());

        if purged > 0 {
            debug!(purged = purged, "Purged expired refresh tokens");
        }

        purged
    }
}

#[async_trait]
impl Authority for TokenAuthority {
    async fn login(&self, subject: &str) -> Result<Credentials, AuthError> {
        TokenAuthority::login(self, subject).map(Credentials::from)
    }

    async fn verify(&self, access_token: &str) -> Result<String, AuthError> {
        self.verify_access(access_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String, AuthError> {
        TokenAuthority::refresh(self, refresh_token).map(AccessToken::into_string)
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), AuthError> {
        TokenAuthority::revoke(self, refresh_token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::tokens::SigningKey;

    fn authority() -> (TokenAuthority, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let keys = TokenKeys::new(
            SigningKey::new(b"access-secret-key-12345".to_vec()),
            SigningKey::new(b"refresh-secret-key-67890".to_vec()),
        );
        let authority = TokenAuthority::with_clock(keys, AuthorityConfig::default(), clock.clone());
        (authority, clock)
    }

    #[test]
    fn test_login_then_verify() {
        let (authority, _) = authority();
        let pair = authority.login("service1").unwrap();

        assert_eq!(authority.verify_access(pair.access.as_str()).unwrap(), "service1");
        assert!(authority.is_active(pair.refresh.as_str()));
        assert_eq!(authority.active_count(), 1);
    }

    #[test]
    fn test_login_requires_subject() {
        let (authority, _) = authority();
        assert_eq!(authority.login("").unwrap_err(), AuthError::Unauthenticated);
        assert_eq!(authority.login("   ").unwrap_err(), AuthError::Unauthenticated);
        assert_eq!(authority.active_count(), 0);
    }

    #[test]
    fn test_access_token_expires() {
        let (authority, clock) = authority();
        let pair = authority.login("service1").unwrap();

        clock.advance(Duration::minutes(14));
        assert!(authority.verify_access(pair.access.as_str()).is_ok());

        clock.advance(Duration::minutes(1));
        assert_eq!(
            authority.verify_access(pair.access.as_str()).unwrap_err(),
            AuthError::InvalidOrExpired
        );
    }

    #[test]
    fn test_verify_rejects_refresh_token() {
        let (authority, _) = authority();
        let pair = authority.login("service1").unwrap();

        assert_eq!(
            authority.verify_access(pair.refresh.as_str()).unwrap_err(),
            AuthError::InvalidOrExpired
        );
        assert_eq!(
            authority.refresh(pair.access.as_str()).unwrap_err(),
            AuthError::Forbidden
        );
    }

    #[test]
    fn test_verify_empty_token() {
        let (authority, _) = authority();
        assert_eq!(authority.verify_access("").unwrap_err(), AuthError::Unauthenticated);
        assert_eq!(authority.refresh("").unwrap_err(), AuthError::Unauthenticated);
    }

    #[test]
    fn test_refresh_is_non_consuming() {
        let (authority, clock) = authority();
        let pair = authority.login("service1").unwrap();

        clock.advance(Duration::minutes(20));
        let first = authority.refresh(pair.refresh.as_str()).unwrap();
        let second = authority.refresh(pair.refresh.as_str()).unwrap();

        assert_eq!(authority.verify_access(first.as_str()).unwrap(), "service1");
        assert_eq!(authority.verify_access(second.as_str()).unwrap(), "service1");
        assert!(authority.is_active(pair.refresh.as_str()));
    }

    #[test]
    fn test_refresh_after_expiry_is_forbidden() {
        let (authority, clock) = authority();
        let pair = authority.login("service1").unwrap();

        clock.advance(Duration::days(7));
        assert_eq!(
            authority.refresh(pair.refresh.as_str()).unwrap_err(),
            AuthError::Forbidden
        );
    }

    #[test]
    fn test_refresh_at_exact_expiry_is_forbidden() {
        let (authority, clock) = authority();
        let pair = authority.login("service1").unwrap();

        clock.advance(Duration::days(7) - Duration::seconds(1));
        assert!(authority.refresh(pair.refresh.as_str()).is_ok());

        // Still in the active set, but past its lifetime
        clock.advance(Duration::seconds(1));
        assert!(authority.is_active(pair.refresh.as_str()));
        assert_eq!(
            authority.refresh(pair.refresh.as_str()).unwrap_err(),
            AuthError::Forbidden
        );
    }

    #[test]
    fn test_revoke_then_refresh_forbidden() {
        let (authority, _) = authority();
        let pair = authority.login("service1").unwrap();

        authority.revoke(pair.refresh.as_str());
        for _ in 0..3 {
            assert_eq!(
                authority.refresh(pair.refresh.as_str()).unwrap_err(),
                AuthError::Forbidden
            );
        }
        assert!(!authority.is_active(pair.refresh.as_str()));
    }

    #[test]
    fn test_revoke_unknown_is_noop() {
        let (authority, _) = authority();
        let pair = authority.login("service1").unwrap();

        authority.revoke("rt-not-a-real-token.sig");
        authority.revoke("");
        authority.revoke(pair.access.as_str());
        assert_eq!(authority.active_count(), 1);

        authority.revoke(pair.refresh.as_str());
        authority.revoke(pair.refresh.as_str());
        assert_eq!(authority.active_count(), 0);
    }

    #[test]
    fn test_revoke_does_not_affect_other_sessions() {
        let (authority, _) = authority();
        let a = authority.login("service1").unwrap();
        let b = authority.login("service1").unwrap();

        authority.revoke(a.refresh.as_str());
        assert!(authority.refresh(a.refresh.as_str()).is_err());
        assert!(authority.refresh(b.refresh.as_str()).is_ok());
    }

    #[test]
    fn test_foreign_refresh_token_forbidden() {
        let (authority, _) = authority();
        let other = TokenAuthority::new(TokenKeys::generate(), AuthorityConfig::default());
        let pair = other.login("intruder").unwrap();

        assert_eq!(
            authority.refresh(pair.refresh.as_str()).unwrap_err(),
            AuthError::Forbidden
        );
        assert_eq!(
            authority.verify_access(pair.access.as_str()).unwrap_err(),
            AuthError::InvalidOrExpired
        );
    }

    #[test]
    fn test_purge_expired() {
        let (authority, clock) = authority();
        let old = authority.login("old").unwrap();
        clock.advance(Duration::days(6));
        let fresh = authority.login("fresh").unwrap();

        assert_eq!(authority.purge_expired(), 0);
        clock.advance(Duration::days(1));
        assert_eq!(authority.purge_expired(), 1);

        assert!(!authority.is_active(old.refresh.as_str()));
        assert!(authority.is_active(fresh.refresh.as_str()));
    }

    #[test]
    fn test_custom_ttls() {
        let clock = Arc::new(ManualClock::starting_now());
        let config = AuthorityConfig::new()
            .access_ttl(Duration::seconds(30))
            .refresh_ttl(Duration::minutes(5));
        let authority = TokenAuthority::with_clock(TokenKeys::generate(), config, clock.clone());
        let pair = authority.login("svc").unwrap();

        clock.advance(Duration::seconds(30));
        assert!(authority.verify_access(pair.access.as_str()).is_err());
        assert!(authority.refresh(pair.refresh.as_str()).is_ok());

        clock.advance(Duration::minutes(5));
        assert!(authority.refresh(pair.refresh.as_str()).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_logins() {
        let authority = Arc::new(TokenAuthority::new(
            TokenKeys::generate(),
            AuthorityConfig::default(),
        ));

        let mut handles = vec![];
        for i in 0..64 {
            let authority = authority.clone();
            handles.push(tokio::spawn(async move {
                let pair = authority.login(&format!("producer-{}", i)).unwrap();
                if i % 2 == 0 {
                    authority.revoke(pair.refresh.as_str());
                }
                pair
            }));
        }

        let mut pairs = vec![];
        for handle in handles {
            pairs.push(handle.await.unwrap());
        }

        assert_eq!(authority.active_count(), 32);
        for (i, pair) in pairs.iter().enumerate() {
            assert_eq!(authority.is_active(pair.refresh.as_str()), i % 2 == 1);
        }
    }

    #[tokio::test]
    async fn test_authority_trait_roundtrip() {
        let (authority, _) = authority();
        let authority: Arc<dyn Authority> = Arc::new(authority);

        let creds = authority.login("service1").await.unwrap();
        assert_eq!(authority.verify(&creds.access_token).await.unwrap(), "service1");

        let access = authority.refresh(&creds.refresh_token).await.unwrap();
        assert_eq!(authority.verify(&access).await.unwrap(), "service1");

        authority.revoke(&creds.refresh_token).await.unwrap();
        assert_eq!(
            authority.refresh(&creds.refresh_token).await.unwrap_err(),
            AuthError::Forbidden
        );
    }
}
