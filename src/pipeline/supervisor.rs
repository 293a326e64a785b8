//! Broker connection lifecycle with backoff
//!
//! State machine:
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...`
//! and `Closed` once shut down.

use super::Shutdown;
use crate::broker::{BrokerChannel, BrokerConnector, QueueName, QueueOptions};
use crate::error::DeliveryError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default pause between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection state of a supervised channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No channel, and no attempt in progress
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Channel open, queue declared, consumer attached
    Connected,
    /// Waiting out the backoff after a failure
    Reconnecting,
    /// Shut down; will not connect again
    Closed,
}

/// Delay policy between connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// Doubles each attempt, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed(delay)
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential { initial, max }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { initial, max } => {
                std::cmp::min(initial.saturating_mul(2u32.saturating_pow(attempt)), max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// What a fresh channel must be set up with before use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub queue: QueueName,
    pub options: QueueOptions,
    /// Attach a consumer with this prefetch; `None` for publish-only channels
    pub prefetch: Option<u16>,
}

impl Topology {
    /// Publish-only channel on a durable queue
    pub fn producer(queue: QueueName) -> Self {
        Self {
            queue,
            options: QueueOptions::durable(),
            prefetch: None,
        }
    }

    /// Consuming channel on a durable queue
    pub fn consumer(queue: QueueName, prefetch: u16) -> Self {
        Self {
            queue,
            options: QueueOptions::durable(),
            prefetch: Some(prefetch),
        }
    }
}

/// Opens channels and re-establishes them after failures
pub struct ReconnectSupervisor {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    backoff: Backoff,
    state: watch::Sender<SupervisorState>,
    connected_once: AtomicBool,
    reconnects: AtomicU64,
}

impl ReconnectSupervisor {
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            connector,
            topology,
            backoff: Backoff::default(),
            state,
            connected_once: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Successful connections after the first one
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// One attempt: connect, declare the queue, attach the consumer
    pub async fn connect(&self) -> Result<Box<dyn BrokerChannel>, DeliveryError> {
        if self.state() == SupervisorState::Closed {
            return Err(DeliveryError::BrokerUnreachable(
                "supervisor is closed".to_string(),
            ));
        }

        self.set_state(SupervisorState::Connecting);
        match self.establish().await {
            Ok(channel) => {
                if self.connected_once.swap(true, Ordering::Relaxed) {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                self.set_state(SupervisorState::Connected);
                Ok(channel)
            }
            Err(e) => {
                self.set_state(SupervisorState::Disconnected);
                Err(e)
            }
        }
    }

    /// Connect, retrying with backoff until it works or shutdown fires
    ///
    /// Returns `None` on shutdown.
    pub async fn connect_with_retry(&self, shutdown: &mut Shutdown) -> Option<Box<dyn BrokerChannel>> {
        self.retry(shutdown, 0).await
    }

    /// Wait out the backoff after a lost channel, then retry like `connect_with_retry`
    pub async fn reconnect(&self, shutdown: &mut Shutdown) -> Option<Box<dyn BrokerChannel>> {
        self.set_state(SupervisorState::Reconnecting);
        if !self.pause(shutdown, self.backoff.delay(0)).await {
            return None;
        }
        self.retry(shutdown, 1).await
    }

    /// Record that the live channel is gone, without retrying
    pub fn mark_disconnected(&self) {
        if self.state() != SupervisorState::Closed {
            self.set_state(SupervisorState::Disconnected);
        }
    }

    pub fn close(&self) {
        self.set_state(SupervisorState::Closed);
        debug!(queue = %self.topology.queue, "Supervisor closed");
    }

    async fn retry(&self, shutdown: &mut Shutdown, mut attempt: u32) -> Option<Box<dyn BrokerChannel>> {
        loop {
            if shutdown.is_triggered() {
                self.close();
                return None;
            }

            match self.connect().await {
                Ok(channel) => return Some(channel),
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        target_broker = %self.connector.describe(),
                        attempt = attempt + 1,
                        error = %e,
                        "Broker connection failed, retrying in {:?}",
                        delay
                    );
                    attempt = attempt.saturating_add(1);
                    self.set_state(SupervisorState::Reconnecting);
                    if !self.pause(shutdown, delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep unless shutdown fires first; false on shutdown
    async fn pause(&self, shutdown: &mut Shutdown, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown.wait() => {
                self.close();
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn establish(&self) -> Result<Box<dyn BrokerChannel>, DeliveryError> {
        let mut channel = self.connector.connect().await?;
        let info = channel
            .declare_queue(&self.topology.queue, self.topology.options)
            .await?;

        if let Some(prefetch) = self.topology.prefetch {
            channel.consume(&self.topology.queue, prefetch).await?;
        }

        info!(
            target_broker = %self.connector.describe(),
            queue = %info.name,
            messages = info.message_count,
            prefetch = ?self.topology.prefetch,
            "Broker channel ready"
        );
        Ok(channel)
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, LocalConnector};
    use crate::pipeline::shutdown_channel;

    fn queue() -> QueueName {
        QueueName::parse("event_queue").unwrap()
    }

    fn supervisor(broker: &Broker, delay: Duration) -> ReconnectSupervisor {
        ReconnectSupervisor::new(
            Arc::new(LocalConnector::new(broker.clone())),
            Topology::consumer(queue(), 1),
        )
        .with_backoff(Backoff::fixed(delay))
    }

    #[test]
    fn test_backoff_fixed() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_exponential_capped() {
        let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_declares_and_attaches() {
        let broker = Broker::new();
        let supervisor = supervisor(&broker, Duration::from_millis(10));
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);

        let _channel = supervisor.connect().await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Connected);

        let info = broker.queue_info(&queue()).unwrap();
        assert!(info.durable);
        let consumers = broker.consumers(&queue());
        assert_eq!(consumers.len(), 1);
        assert_eq!(consumers[0].prefetch, 1);
    }

    #[tokio::test]
    async fn test_single_attempt_failure() {
        let broker = Broker::new();
        broker.set_available(false);
        let supervisor = supervisor(&broker, Duration::from_millis(10));

        let err = supervisor.connect().await.err().unwrap();
        assert!(err.is_connection_loss());
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
    }

    #[tokio::test]
    async fn test_retry_until_available() {
        let broker = Broker::new();
        broker.set_available(false);
        let supervisor = supervisor(&broker, Duration::from_millis(20));
        let (_trigger, mut shutdown) = shutdown_channel();

        let restore = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(70)).await;
                broker.set_available(true);
            })
        };

        let channel = tokio::time::timeout(
            Duration::from_secs(2),
            supervisor.connect_with_retry(&mut shutdown),
        )
        .await
        .unwrap();
        restore.await.unwrap();

        assert!(channel.is_some());
        assert_eq!(supervisor.state(), SupervisorState::Connected);
        // First success is not a reconnect
        assert_eq!(supervisor.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_transitions() {
        let broker = Broker::new();
        let supervisor = supervisor(&broker, Duration::from_millis(20));
        let (_trigger, mut shutdown) = shutdown_channel();
        let mut states = supervisor.subscribe();

        let channel = supervisor.connect_with_retry(&mut shutdown).await.unwrap();
        broker.drop_connections();
        drop(channel);

        let reconnecting = supervisor.reconnect(&mut shutdown);
        let channel = tokio::time::timeout(Duration::from_secs(2), reconnecting)
            .await
            .unwrap();

        assert!(channel.is_some());
        assert_eq!(supervisor.reconnects(), 1);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retry() {
        let broker = Broker::new();
        broker.set_available(false);
        let supervisor = supervisor(&broker, Duration::from_secs(60));
        let (trigger, mut shutdown) = shutdown_channel();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.trigger();
        });

        let channel = tokio::time::timeout(
            Duration::from_secs(2),
            supervisor.connect_with_retry(&mut shutdown),
        )
        .await
        .unwrap();
        stopper.await.unwrap();

        assert!(channel.is_none());
        assert_eq!(supervisor.state(), SupervisorState::Closed);
    }

    #[tokio::test]
    async fn test_closed_supervisor_refuses_connect() {
        let broker = Broker::new();
        let supervisor = supervisor(&broker, Duration::from_millis(10));
        supervisor.close();

        assert!(supervisor.connect().await.is_err());
        assert_eq!(broker.connection_count(), 0);
    }
}
