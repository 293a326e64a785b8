//! WebSocket broker protocol
//!
//! JSON text frames tagged by `type`. Message bodies travel base64-encoded.

use crate::error::DeliveryError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_prefetch() -> u16 {
    1
}

/// Messages from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare a queue (idempotent)
    Declare {
        queue: String,
        #[serde(default = "default_true")]
        durable: bool,
    },
    /// Append a message to a queue
    Publish {
        queue: String,
        body: String,
        #[serde(default = "default_true")]
        persistent: bool,
    },
    /// Start consuming from a queue
    Consume {
        queue: String,
        #[serde(default = "default_prefetch")]
        prefetch: u16,
    },
    /// Settle a delivery as done
    Ack { delivery_tag: u64 },
    /// Settle a delivery as failed
    Nack {
        delivery_tag: u64,
        #[serde(default = "default_true")]
        requeue: bool,
    },
    /// Ping for keepalive
    Ping { seq: u64 },
}

/// Messages from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Declare confirmed
    Declared {
        queue: String,
        durable: bool,
        message_count: usize,
    },
    /// Publish confirmed
    Published { queue: String },
    /// Consumer attached
    ConsumeOk { queue: String, prefetch: u16 },
    /// A message for the consumer on this connection
    Deliver {
        delivery_tag: u64,
        redelivered: bool,
        body: String,
    },
    /// Pong response
    Pong { seq: u64 },
    /// Request failed
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(err: &DeliveryError) -> Self {
        let message = match err {
            DeliveryError::BrokerUnreachable(m)
            | DeliveryError::MalformedEnvelope(m)
            | DeliveryError::QueueNotFound(m)
            | DeliveryError::PreconditionFailed(m)
            | DeliveryError::Rejected(m) => m.clone(),
        };
        ServerMessage::Error {
            message,
            code: Some(error_code(err).to_string()),
        }
    }
}

/// Stable code carried in `error` replies
pub fn error_code(err: &DeliveryError) -> &'static str {
    match err {
        DeliveryError::BrokerUnreachable(_) => "broker_unreachable",
        DeliveryError::MalformedEnvelope(_) => "malformed",
        DeliveryError::QueueNotFound(_) => "queue_not_found",
        DeliveryError::PreconditionFailed(_) => "precondition_failed",
        DeliveryError::Rejected(_) => "rejected",
    }
}

/// Turn an `error` reply back into a `DeliveryError`
///
/// Unknown or missing codes map to `Rejected`.
pub fn error_from_reply(code: Option<&str>, message: String) -> DeliveryError {
    match code {
        Some("broker_unreachable") => DeliveryError::BrokerUnreachable(message),
        Some("malformed") => DeliveryError::MalformedEnvelope(message),
        Some("queue_not_found") => DeliveryError::QueueNotFound(message),
        Some("precondition_failed") => DeliveryError::PreconditionFailed(message),
        _ => DeliveryError::Rejected(message),
    }
}

pub fn encode_body(body: &[u8]) -> String {
    STANDARD.encode(body)
}

pub fn decode_body(body: &str) -> Result<Vec<u8>, DeliveryError> {
    STANDARD
        .decode(body)
        .map_err(|e| DeliveryError::MalformedEnvelope(format!("body is not base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"consume","queue":"event_queue"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Consume {
                queue: "event_queue".into(),
                prefetch: 1
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"nack","delivery_tag":4}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Nack {
                delivery_tag: 4,
                requeue: true
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"declare","queue":"q"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Declare {
                queue: "q".into(),
                durable: true
            }
        );
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_value(ServerMessage::ConsumeOk {
            queue: "q".into(),
            prefetch: 1,
        })
        .unwrap();
        assert_eq!(json["type"], "consume_ok");

        let json = serde_json::to_value(ServerMessage::Deliver {
            delivery_tag: 1,
            redelivered: false,
            body: encode_body(b"{}"),
        })
        .unwrap();
        assert_eq!(json["type"], "deliver");
        assert_eq!(json["body"], "e30=");
    }

    #[test]
    fn test_error_reply_round_trip() {
        let original = DeliveryError::QueueNotFound("event_queue".into());
        let ServerMessage::Error { message, code } = ServerMessage::error(&original) else {
            panic!("expected error reply");
        };
        assert_eq!(code.as_deref(), Some("queue_not_found"));
        assert_eq!(error_from_reply(code.as_deref(), message), original);

        assert_eq!(
            error_from_reply(None, "nope".into()),
            DeliveryError::Rejected("nope".into())
        );
    }

    #[test]
    fn test_decode_body_rejects_garbage() {
        assert_eq!(decode_body("aGVsbG8=").unwrap(), b"hello");
        assert!(matches!(
            decode_body("not base64!"),
            Err(DeliveryError::MalformedEnvelope(_))
        ));
    }
}
