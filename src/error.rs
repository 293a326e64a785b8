//! Error types for the pipeline
//!
//! - `AuthError`: credential lifecycle failures (authority side)
//! - `DeliveryError`: broker connection and envelope failures
//! - `ProcessingError`: domain handler failures (transient, requeued)
//! - `PublishError`: a failed send as seen by the producer's caller

use thiserror::Error;

/// Errors returned by the token authority
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No credential (or no subject) was presented
    #[error("Unauthenticated: no credential presented")]
    Unauthenticated,

    /// Signature or expiry check failed on an access token
    #[error("Invalid or expired token")]
    InvalidOrExpired,

    /// Refresh token not in the active set, or its own checks failed
    #[error("Forbidden: invalid refresh token")]
    Forbidden,

    /// A remote authority could not be contacted
    #[error("Authority unreachable: {0}")]
    Unreachable(String),
}

impl AuthError {
    /// Whether the credential itself was judged (as opposed to the authority being down)
    pub fn is_credential_failure(&self) -> bool {
        !matches!(self, AuthError::Unreachable(_))
    }
}

/// Errors from the broker connection or the message body
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Connect/publish/consume I/O failure, including an unexpected close
    #[error("Broker unreachable: {0}")]
    BrokerUnreachable(String),

    /// Body is not parseable or is missing required fields
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Publish or consume against an undeclared queue
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Declare mismatch, unknown delivery tag, or exhausted prefetch window
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The broker answered with an error reply
    #[error("Rejected by broker: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Whether the connection is gone and must be re-established
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, DeliveryError::BrokerUnreachable(_))
    }
}

/// Errors raised by a domain handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessingError {
    /// Domain logic failed on an otherwise-valid message
    #[error("Handler failure: {0}")]
    HandlerFailure(String),
}

impl ProcessingError {
    pub fn handler(message: impl Into<String>) -> Self {
        ProcessingError::HandlerFailure(message.into())
    }
}

/// A failed send, surfaced to the producer's caller
#[derive(Debug, Error)]
pub enum PublishError {
    /// Could not obtain a valid credential (login failed)
    #[error("Credential error: {0}")]
    Auth(#[from] AuthError),

    /// Could not hand the event to the broker
    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Failed to serialize the event
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
