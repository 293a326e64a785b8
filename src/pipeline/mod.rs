//! Producer and consumer sides of the event pipeline
//!
//! - `CredentialedProducer`: keeps a valid access token and publishes events
//! - `GatedConsumer`: pulls events, checks their tokens, runs a handler
//! - `ReconnectSupervisor`: owns the broker connection lifecycle for both

mod consumer;
mod event;
mod producer;
mod supervisor;

pub use consumer::{ConsumerStats, DeliveryContext, Disposition, EventHandler, GatedConsumer};
pub use event::{DeliveryEnvelope, Event, NewEvent};
pub use producer::{CredentialState, CredentialedProducer, ProducerStats};
pub use supervisor::{Backoff, ReconnectSupervisor, SupervisorState, Topology};

use tokio::sync::watch;

/// Create a linked shutdown trigger and listener
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Fires shutdown. Dropping the trigger also counts as shutdown.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

/// Listens for shutdown
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&mut self) {
        // Err means the trigger was dropped
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_trigger() {
        let (trigger, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_triggered());

        trigger.trigger();
        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);

        assert!(shutdown.is_triggered());
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_after_trigger() {
        let (trigger, _shutdown) = shutdown_channel();
        trigger.trigger();

        let late = trigger.subscribe();
        assert!(late.is_triggered());
    }
}
