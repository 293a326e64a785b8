//! tokenbus remote client
//!
//! Network implementations of the `tokenbus` seams, for producers and
//! workers running outside the `tokenbus serve` process:
//!
//! - [`HttpAuthority`]: the `Authority` trait over the HTTP token routes
//! - [`WsConnector`]: the `BrokerConnector` trait over the `/ws` broker socket
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenbus::pipeline::{CredentialedProducer, NewEvent, ReconnectSupervisor, Topology};
//! use tokenbus_client::{ClientConfig, HttpAuthority, WsConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::default();
//!     let authority = HttpAuthority::new(&config.authority_url, config.request_timeout)?;
//!     let connector = WsConnector::new(&config.broker_url, config.request_timeout)?;
//!
//!     let supervisor = ReconnectSupervisor::new(
//!         Arc::new(connector),
//!         Topology::producer(config.queue_name()?),
//!     )
//!     .with_backoff(config.backoff());
//!
//!     let mut producer = CredentialedProducer::new("service1", Arc::new(authority), supervisor);
//!     producer
//!         .publish(NewEvent::new("USER_ACTION", "User performed an action"))
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod authority;
mod broker;
mod config;
mod error;

pub use authority::HttpAuthority;
pub use broker::{WsChannel, WsConnector};
pub use config::ClientConfig;
pub use error::ClientError;
