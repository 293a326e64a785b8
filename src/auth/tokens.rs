//! Bearer token encoding and signature checks
//!
//! Token prefixes:
//! - `at-` : Access token (short-lived, signed with the access key)
//! - `rt-` : Refresh token (long-lived, signed with the refresh key)
//!
//! Layout: `<prefix><claims_b64>.<signature_b64>` where the signature is
//! HMAC-SHA256 over `<prefix><claims_b64>`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Token prefixes
pub const ACCESS_TOKEN_PREFIX: &str = "at-";
pub const REFRESH_TOKEN_PREFIX: &str = "rt-";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format")]
    InvalidFormat,

    #[error("invalid token prefix: expected '{expected}', got '{got}'")]
    InvalidPrefix { expected: String, got: String },

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token decode error: {0}")]
    DecodeError(String),

    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Which of the two token kinds a token is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            TokenKind::Access => ACCESS_TOKEN_PREFIX,
            TokenKind::Refresh => REFRESH_TOKEN_PREFIX,
        }
    }

    /// Detect the kind from a token's prefix
    pub fn of(token: &str) -> Option<Self> {
        if token.starts_with(ACCESS_TOKEN_PREFIX) {
            Some(TokenKind::Access)
        } else if token.starts_with(REFRESH_TOKEN_PREFIX) {
            Some(TokenKind::Refresh)
        } else {
            None
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => write!(f, "access"),
            TokenKind::Refresh => write!(f, "refresh"),
        }
    }
}

/// HMAC key for one token kind
#[derive(Clone)]
pub struct SigningKey {
    key: Vec<u8>,
}

impl SigningKey {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// Generate a random 256-bit key
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        Self::new(bytes.to_vec())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size")
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningKey([REDACTED])")
    }
}

/// Distinct keys per token kind
#[derive(Debug, Clone)]
pub struct TokenKeys {
    pub access: SigningKey,
    pub refresh: SigningKey,
}

impl TokenKeys {
    pub fn new(access: SigningKey, refresh: SigningKey) -> Self {
        Self { access, refresh }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(), SigningKey::generate())
    }
}

/// Claims carried inside a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject the token was issued to
    pub sub: String,
    /// Issued-at, unix seconds
    pub iat: i64,
    /// Expires-at, unix seconds
    pub exp: i64,
    /// Unique token identity
    pub jti: Uuid,
}

impl TokenClaims {
    fn new(subject: &str, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        let iat = issued_at.timestamp();
        Self {
            sub: subject.to_string(),
            iat,
            exp: iat + ttl.num_seconds(),
            jti: Uuid::new_v4(),
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// A token is live only while now < expiresAt
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

fn sign(kind: TokenKind, claims: &TokenClaims, key: &SigningKey) -> String {
    let claims_json = serde_json::to_vec(claims).expect("serialize claims");
    let signed_part = format!("{}{}", kind.prefix(), URL_SAFE_NO_PAD.encode(claims_json));

    let mut mac = key.mac();
    mac.update(signed_part.as_bytes());
    let signature = mac.finalize().into_bytes();

    format!("{}.{}", signed_part, URL_SAFE_NO_PAD.encode(signature))
}

/// Check prefix and signature, then decode claims. Expiry is not checked here.
fn decode(kind: TokenKind, token: &str, key: &SigningKey) -> Result<TokenClaims, TokenError> {
    if !token.starts_with(kind.prefix()) {
        return Err(TokenError::InvalidPrefix {
            expected: kind.prefix().to_string(),
            got: token.chars().take(3).collect(),
        });
    }

    let (signed_part, signature_b64) = token.rsplit_once('.').ok_or(TokenError::InvalidFormat)?;
    let claims_b64 = &signed_part[kind.prefix().len()..];
    if claims_b64.is_empty() || claims_b64.contains('.') {
        return Err(TokenError::InvalidFormat);
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|e| TokenError::DecodeError(e.to_string()))?;

    let mut mac = key.mac();
    mac.update(signed_part.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::InvalidSignature)?;

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_b64)
        .map_err(|e| TokenError::DecodeError(e.to_string()))?;

    serde_json::from_slice(&claims_json).map_err(|e| TokenError::DecodeError(e.to_string()))
}

/// Decode claims without checking the signature (diagnostics only)
pub fn inspect(token: &str) -> Result<(TokenKind, TokenClaims), TokenError> {
    let kind = TokenKind::of(token).ok_or(TokenError::InvalidFormat)?;
    let (signed_part, _) = token.rsplit_once('.').ok_or(TokenError::InvalidFormat)?;
    let claims_json = URL_SAFE_NO_PAD
        .decode(&signed_part[kind.prefix().len()..])
        .map_err(|e| TokenError::DecodeError(e.to_string()))?;
    let claims = serde_json::from_slice(&claims_json)
        .map_err(|e| TokenError::DecodeError(e.to_string()))?;
    Ok((kind, claims))
}

/// A signed, short-lived access token
#[derive(Debug, Clone)]
pub struct AccessToken {
    token: String,
    claims: TokenClaims,
}

impl AccessToken {
    /// Issue a new access token for `subject`
    pub fn issue(subject: &str, now: DateTime<Utc>, ttl: Duration, key: &SigningKey) -> Self {
        let claims = TokenClaims::new(subject, now, ttl);
        let token = sign(TokenKind::Access, &claims, key);
        Self { token, claims }
    }

    /// Parse and verify signature and expiry
    pub fn verify(token: &str, key: &SigningKey, now: DateTime<Utc>) -> Result<Self, TokenError> {
        let claims = decode(TokenKind::Access, token, key)?;
        if claims.is_expired_at(now) {
            return Err(TokenError::Expired(claims.expires_at()));
        }

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims.expires_at()
    }

    pub fn into_string(self) -> String {
        self.token
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// A signed, long-lived refresh token
#[derive(Debug, Clone)]
pub struct RefreshToken {
    token: String,
    claims: TokenClaims,
}

impl RefreshToken {
    /// Issue a new refresh token for `subject`
    pub fn issue(subject: &str, now: DateTime<Utc>, ttl: Duration, key: &SigningKey) -> Self {
        let claims = TokenClaims::new(subject, now, ttl);
        let token = sign(TokenKind::Refresh, &claims, key);
        Self { token, claims }
    }

    /// Parse and verify the signature only
    ///
    /// Expiry and active-set membership are the authority's concern.
    pub fn parse(token: &str, key: &SigningKey) -> Result<Self, TokenError> {
        let claims = decode(TokenKind::Refresh, token, key)?;
        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    /// Parse and verify signature and expiry
    pub fn verify(token: &str, key: &SigningKey, now: DateTime<Utc>) -> Result<Self, TokenError> {
        let parsed = Self::parse(token, key)?;
        if parsed.claims.is_expired_at(now) {
            return Err(TokenError::Expired(parsed.claims.expires_at()));
        }
        Ok(parsed)
    }

    /// Identity used for the active-refresh set
    pub fn id(&self) -> Uuid {
        self.claims.jti
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims.expires_at()
    }

    pub fn into_string(self) -> String {
        self.token
    }
}

impl fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> TokenKeys {
        TokenKeys::new(
            SigningKey::new(b"access-secret-for-tests".to_vec()),
            SigningKey::new(b"refresh-secret-for-tests".to_vec()),
        )
    }

    #[test]
    fn test_access_token_issue_verify() {
        let keys = keys();
        let now = Utc::now();
        let token = AccessToken::issue("service1", now, Duration::minutes(15), &keys.access);
        assert!(token.as_str().starts_with(ACCESS_TOKEN_PREFIX));

        let parsed = AccessToken::verify(token.as_str(), &keys.access, now).unwrap();
        assert_eq!(parsed.subject(), "service1");
        assert_eq!(parsed.claims().exp - parsed.claims().iat, 15 * 60);
    }

    #[test]
    fn test_access_token_wrong_key() {
        let keys = keys();
        let now = Utc::now();
        let token = AccessToken::issue("service1", now, Duration::minutes(15), &keys.access);

        let result = AccessToken::verify(token.as_str(), &SigningKey::new(b"wrong".to_vec()), now);
        assert_eq!(result.unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn test_access_token_expired() {
        let keys = keys();
        let now = Utc::now();
        let token = AccessToken::issue("service1", now, Duration::minutes(15), &keys.access);

        let later = token.expires_at();
        let result = AccessToken::verify(token.as_str(), &keys.access, later);
        assert!(matches!(result, Err(TokenError::Expired(_))));

        let just_before = later - Duration::seconds(1);
        assert!(AccessToken::verify(token.as_str(), &keys.access, just_before).is_ok());
    }

    #[test]
    fn test_kinds_are_not_interchangeable() {
        let keys = keys();
        let now = Utc::now();
        let access = AccessToken::issue("svc", now, Duration::minutes(15), &keys.access);
        let refresh = RefreshToken::issue("svc", now, Duration::days(7), &keys.refresh);

        assert!(matches!(
            RefreshToken::parse(access.as_str(), &keys.refresh),
            Err(TokenError::InvalidPrefix { .. })
        ));
        assert!(matches!(
            AccessToken::verify(refresh.as_str(), &keys.access, now),
            Err(TokenError::InvalidPrefix { .. })
        ));

        // Same key, swapped prefix: the prefix is part of the MAC input
        let shared = SigningKey::new(b"same".to_vec());
        let access = AccessToken::issue("svc", now, Duration::minutes(15), &shared);
        let forged = access.as_str().replacen(ACCESS_TOKEN_PREFIX, REFRESH_TOKEN_PREFIX, 1);
        assert_eq!(
            RefreshToken::parse(&forged, &shared).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let keys = keys();
        let now = Utc::now();
        let token = AccessToken::issue("svc", now, Duration::minutes(15), &keys.access);

        let (_, claims) = inspect(token.as_str()).unwrap();
        let mut forged_claims = claims.clone();
        forged_claims.sub = "admin".to_string();
        let forged_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let signature = token.as_str().rsplit_once('.').unwrap().1;
        let forged = format!("{}{}.{}", ACCESS_TOKEN_PREFIX, forged_b64, signature);

        assert_eq!(
            AccessToken::verify(&forged, &keys.access, now).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn test_malformed_tokens() {
        let keys = keys();
        let now = Utc::now();
        assert_eq!(
            AccessToken::verify("at-nodot", &keys.access, now).unwrap_err(),
            TokenError::InvalidFormat
        );
        assert!(matches!(
            AccessToken::verify("at-abc.!!!", &keys.access, now),
            Err(TokenError::DecodeError(_))
        ));
        assert!(matches!(
            AccessToken::verify("garbage", &keys.access, now),
            Err(TokenError::InvalidPrefix { .. })
        ));
    }

    #[test]
    fn test_refresh_token_verify_checks_expiry() {
        let keys = keys();
        let now = Utc::now();
        let token = RefreshToken::issue("service1", now, Duration::days(7), &keys.refresh);

        let parsed = RefreshToken::verify(token.as_str(), &keys.refresh, now).unwrap();
        assert_eq!(parsed.id(), token.id());

        let later = token.expires_at();
        assert!(matches!(
            RefreshToken::verify(token.as_str(), &keys.refresh, later),
            Err(TokenError::Expired(_))
        ));
        // Signature-only parsing still accepts it
        assert!(RefreshToken::parse(token.as_str(), &keys.refresh).is_ok());
        assert_eq!(
            RefreshToken::verify(token.as_str(), &keys.access, now).unwrap_err(),
            TokenError::InvalidSignature
        );
    }

    #[test]
    fn test_refresh_tokens_have_unique_ids() {
        let keys = keys();
        let now = Utc::now();
        let a = RefreshToken::issue("svc", now, Duration::days(7), &keys.refresh);
        let b = RefreshToken::issue("svc", now, Duration::days(7), &keys.refresh);
        assert_ne!(a.id(), b.id());
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_inspect() {
        let keys = keys();
        let now = Utc::now();
        let token = RefreshToken::issue("worker-2", now, Duration::days(7), &keys.refresh);
        let (kind, claims) = inspect(token.as_str()).unwrap();
        assert_eq!(kind, TokenKind::Refresh);
        assert_eq!(claims.sub, "worker-2");
        assert_eq!(claims.jti, token.id());
    }

    #[test]
    fn test_signing_key_debug_redacted() {
        let key = SigningKey::new(b"top-secret".to_vec());
        assert_eq!(format!("{:?}", key), "SigningKey([REDACTED])");
    }
}
