//! tokenbus - token-gated durable event pipeline
//!
//! Producers hold a short-lived access token (refreshed, or re-issued by
//! login, when it is rejected) and stamp it on every event they publish to a
//! durable queue. Consumers verify that token before running domain logic:
//! events with missing or rejected tokens are dropped, events whose handler
//! fails are requeued. Broker connections are supervised and re-established
//! with backoff.

pub mod auth;
pub mod broker;
pub mod error;
pub mod pipeline;
pub mod server;

pub use auth::{Authority, Credentials, TokenAuthority};
pub use broker::{Broker, BrokerChannel, BrokerConnector, LocalConnector, QueueName};
pub use error::{AuthError, DeliveryError, ProcessingError, PublishError};
pub use pipeline::{
    CredentialedProducer, DeliveryContext, Event, EventHandler, GatedConsumer, NewEvent,
    ReconnectSupervisor,
};
