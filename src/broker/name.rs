//! Queue naming
//!
//! Queue names are dot-separated segments: `event_queue`, `billing.invoices`
//! Each segment must match: [a-zA-Z0-9_-]+
//!
//! Names starting with `amq.` are reserved by the broker.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted queue name, in bytes
pub const MAX_QUEUE_NAME_LEN: usize = 255;

const RESERVED_PREFIX: &str = "amq.";

/// Valid characters for a queue name segment
fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate a single segment
fn is_valid_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_segment_char)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueNameError {
    #[error("queue name cannot be empty")]
    Empty,

    #[error("queue name is {0} bytes, limit is 255")]
    TooLong(usize),

    #[error("invalid segment '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("empty segment in queue name")]
    EmptySegment,

    #[error("queue names starting with 'amq.' are reserved")]
    Reserved,
}

/// A validated queue name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Parse and validate a queue name
    pub fn parse(name: &str) -> Result<Self, QueueNameError> {
        if name.is_empty() {
            return Err(QueueNameError::Empty);
        }

        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(QueueNameError::TooLong(name.len()));
        }

        if name.starts_with(RESERVED_PREFIX) {
            return Err(QueueNameError::Reserved);
        }

        for part in name.split('.') {
            if part.is_empty() {
                return Err(QueueNameError::EmptySegment);
            }

            if !is_valid_segment(part) {
                return Err(QueueNameError::InvalidSegment(part.to_string()));
            }
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = QueueNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        QueueName::parse(&value)
    }
}

impl From<QueueName> for String {
    fn from(name: QueueName) -> Self {
        name.0
    }
}

impl std::str::FromStr for QueueName {
    type Err = QueueNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_parse_valid() {
        assert!(QueueName::parse("event_queue").is_ok());
        assert!(QueueName::parse("events").is_ok());
        assert!(QueueName::parse("billing.invoices").is_ok());
        assert!(QueueName::parse("worker-1.retry").is_ok());
    }

    #[test]
    fn test_queue_name_parse_invalid() {
        assert_eq!(QueueName::parse(""), Err(QueueNameError::Empty));
        assert_eq!(
            QueueName::parse("billing..invoices"),
            Err(QueueNameError::EmptySegment)
        );
        assert_eq!(
            QueueName::parse("event queue"),
            Err(QueueNameError::InvalidSegment("event queue".into()))
        );
        assert!(QueueName::parse("events@1").is_err());
        assert!(QueueName::parse("events.").is_err());
    }

    #[test]
    fn test_queue_name_reserved_prefix() {
        assert_eq!(QueueName::parse("amq.gen-1"), Err(QueueNameError::Reserved));
        // Only the exact prefix is reserved
        assert!(QueueName::parse("amqp.events").is_ok());
    }

    #[test]
    fn test_queue_name_length_limit() {
        let longest = "q".repeat(MAX_QUEUE_NAME_LEN);
        assert!(QueueName::parse(&longest).is_ok());

        let too_long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        assert_eq!(
            QueueName::parse(&too_long),
            Err(QueueNameError::TooLong(MAX_QUEUE_NAME_LEN + 1))
        );
    }

    #[test]
    fn test_queue_name_serde() {
        let name: QueueName = serde_json::from_str("\"event_queue\"").unwrap();
        assert_eq!(name.as_str(), "event_queue");
        assert_eq!(serde_json::to_string(&name).unwrap(), "\"event_queue\"");

        assert!(serde_json::from_str::<QueueName>("\"bad name\"").is_err());
    }
}
