//! Durable message broker
//!
//! The engine (`Broker`) owns named queues and per-connection delivery state.
//! Producers and consumers never touch it directly: they go through a
//! `BrokerConnector`, which hands out `BrokerChannel`s. `LocalConnector` talks
//! to an in-process engine; `tokenbus-client` provides a WebSocket connector
//! for an engine served by `tokenbus serve`.
//!
//! Delivery is at-least-once: a delivery stays unacked until the holder acks
//! or nacks it, and closing a connection puts every unacked delivery back at
//! the head of its queue with `redelivered = true`.

mod engine;
mod local;
mod name;
mod queue;

pub use engine::{Broker, BrokerSession};
pub use local::{LocalChannel, LocalConnector};
pub use name::{QueueName, QueueNameError, MAX_QUEUE_NAME_LEN};

use crate::error::DeliveryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Handle identifying one delivery on one connection
pub type DeliveryTag = u64;

/// Options for declaring a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Survives a broker restart
    pub durable: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self { durable: true }
    }

    pub fn transient() -> Self {
        Self { durable: false }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// Queue state as reported by a declare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: QueueName,
    pub durable: bool,
    /// Messages ready for delivery (excludes unacked)
    pub message_count: usize,
    pub consumer_count: usize,
}

/// A consumer attached to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub connection_id: u64,
    /// 0 means unbounded
    pub prefetch: u16,
    pub unacked: usize,
}

/// A message handed to a consumer, awaiting settlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Opens broker channels
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a new connection and channel
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, DeliveryError>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// One open channel to the broker
///
/// A channel carries at most one consumer. Dropping a channel closes it.
#[async_trait]
pub trait BrokerChannel: Send {
    /// Declare a queue; idempotent when the options match
    async fn declare_queue(
        &mut self,
        queue: &QueueName,
        options: QueueOptions,
    ) -> Result<QueueInfo, DeliveryError>;

    /// Append a message to a declared queue
    async fn publish(
        &mut self,
        queue: &QueueName,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<(), DeliveryError>;

    /// Start consuming with at most `prefetch` unacked deliveries (0 = unbounded)
    async fn consume(&mut self, queue: &QueueName, prefetch: u16) -> Result<(), DeliveryError>;

    /// Wait for the next delivery
    ///
    /// Cancel-safe: dropping the future never loses a delivery.
    async fn next_delivery(&mut self) -> Result<Delivery, DeliveryError>;

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), DeliveryError>;

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), DeliveryError>;

    /// Close the channel; unacked deliveries are requeued
    async fn close(&mut self) -> Result<(), DeliveryError>;
}
