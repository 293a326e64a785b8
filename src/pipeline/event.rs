//! Event wire format and the delivery envelope around it

use crate::broker::{BrokerChannel, Delivery, DeliveryTag};
use crate::error::DeliveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A domain event as it travels through the broker
///
/// Wire form: `{type, message, data, timestamp, token}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Access token of the producer, checked by every consumer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Event {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, DeliveryError> {
        serde_json::from_slice(body).map_err(|e| DeliveryError::MalformedEnvelope(e.to_string()))
    }

    /// The token, if present and non-empty
    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// An event before the producer stamps it with a token and a timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: String,
    pub message: String,
    pub data: Value,
}

impl NewEvent {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: Value::Object(Default::default()),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn stamp(self, token: String, timestamp: DateTime<Utc>) -> Event {
        Event {
            kind: self.kind,
            message: self.message,
            data: self.data,
            timestamp,
            token: Some(token),
        }
    }
}

/// A delivery awaiting settlement
///
/// Settling consumes the envelope, so each delivery is acked or nacked once.
#[derive(Debug)]
pub struct DeliveryEnvelope {
    tag: DeliveryTag,
    redelivered: bool,
    event: Result<Event, DeliveryError>,
}

impl DeliveryEnvelope {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            tag: delivery.tag,
            redelivered: delivery.redelivered,
            event: Event::from_bytes(&delivery.body),
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The parsed event, or why the body could not be parsed
    pub fn event(&self) -> Result<&Event, &DeliveryError> {
        self.event.as_ref()
    }

    pub async fn ack(self, channel: &mut dyn BrokerChannel) -> Result<(), DeliveryError> {
        channel.ack(self.tag).await
    }

    pub async fn nack(self, channel: &mut dyn BrokerChannel, requeue: bool) -> Result<(), DeliveryError> {
        channel.nack(self.tag, requeue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = NewEvent::new("USER_ACTION", "clicked")
            .with_data(json!({"button": "save"}))
            .stamp("at-abc.def".into(), "2024-05-01T12:00:00Z".parse().unwrap());

        let value: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "USER_ACTION");
        assert_eq!(value["message"], "clicked");
        assert_eq!(value["data"]["button"], "save");
        assert_eq!(value["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(value["token"], "at-abc.def");
    }

    #[test]
    fn test_event_without_token() {
        let body = br#"{"type":"X","message":"m","timestamp":"2024-05-01T12:00:00Z"}"#;
        let event = Event::from_bytes(body).unwrap();

        assert!(event.token.is_none());
        assert!(event.bearer().is_none());
        assert_eq!(event.data, Value::Null);
    }

    #[test]
    fn test_empty_token_is_no_bearer() {
        let body = br#"{"type":"X","message":"m","timestamp":"2024-05-01T12:00:00Z","token":""}"#;
        let event = Event::from_bytes(body).unwrap();
        assert!(event.bearer().is_none());
    }

    #[test]
    fn test_malformed_body() {
        let err = Event::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, DeliveryError::MalformedEnvelope(_)));

        // Valid JSON, missing required fields
        let err = Event::from_bytes(br#"{"message":"m"}"#).unwrap_err();
        assert!(matches!(err, DeliveryError::MalformedEnvelope(_)));
    }

    #[test]
    fn test_envelope_keeps_parse_error() {
        let envelope = DeliveryEnvelope::new(Delivery {
            tag: 3,
            redelivered: true,
            body: b"{".to_vec(),
        });

        assert_eq!(envelope.tag(), 3);
        assert!(envelope.redelivered());
        assert!(envelope.event().is_err());
    }
}
