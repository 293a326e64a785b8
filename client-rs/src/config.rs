//! Configuration for tokenbus clients

use crate::error::ClientError;
use std::time::Duration;
use tokenbus::broker::QueueName;
use tokenbus::pipeline::Backoff;

/// Where the authority and broker live, and how to talk to them
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Authority base URL (e.g., "http://localhost:3000")
    pub authority_url: String,

    /// Broker WebSocket URL (e.g., "ws://localhost:3000/ws")
    pub broker_url: String,

    /// Queue to publish to / consume from
    pub queue: String,

    /// Unacked deliveries a consumer may hold
    pub prefetch: u16,

    /// Delay before reconnecting (and the first step of exponential backoff)
    pub reconnect_delay: Duration,

    /// Cap for exponential backoff; `None` keeps the delay fixed
    pub max_reconnect_delay: Option<Duration>,

    /// Timeout for a single authority or broker request
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Create a new configuration with the given endpoints
    pub fn new(authority_url: impl Into<String>, broker_url: impl Into<String>) -> Self {
        Self {
            authority_url: authority_url.into(),
            broker_url: broker_url.into(),
            queue: "event_queue".to_string(),
            prefetch: 1,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: None,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the queue name
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Set the consumer prefetch
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Use a fixed reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = None;
        self
    }

    /// Double the reconnect delay on each failed attempt, up to `max`
    pub fn exponential_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = Some(max);
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn backoff(&self) -> Backoff {
        match self.max_reconnect_delay {
            Some(max) => Backoff::exponential(self.reconnect_delay, max),
            None => Backoff::fixed(self.reconnect_delay),
        }
    }

    pub fn queue_name(&self) -> Result<QueueName, ClientError> {
        QueueName::parse(&self.queue).map_err(|e| ClientError::Config(format!("queue: {}", e)))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://localhost:3000", "ws://localhost:3000/ws")
    }
}
