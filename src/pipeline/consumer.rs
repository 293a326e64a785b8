//! Consuming side: token-gated event processing

use super::event::{DeliveryEnvelope, Event};
use super::supervisor::ReconnectSupervisor;
use super::Shutdown;
use crate::auth::Authority;
use crate::broker::{BrokerChannel, DeliveryTag};
use crate::error::{AuthError, DeliveryError, ProcessingError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause before requeueing when the authority cannot be reached
pub const DEFAULT_AUTHORITY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What a handler knows about the delivery it is processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Subject of the verified token
    pub subject: String,
    pub redelivered: bool,
    pub delivery_tag: DeliveryTag,
    pub worker_id: String,
}

/// Domain logic run on every event whose token verifies
///
/// An `Err` requeues the event for another attempt.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, ctx: &DeliveryContext) -> Result<(), ProcessingError>;
}

/// How one delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; acked
    Processed,
    /// No token on the event; acked without processing
    DroppedTokenless,
    /// Token rejected by the authority; acked without processing
    DroppedInvalidToken,
    /// Body could not be parsed; acked without processing
    DroppedMalformed,
    /// Handler failed or the authority was unreachable; nacked with requeue
    Requeued,
}

/// Consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub processed: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
}

/// Pulls events one settlement at a time and runs them through the handler
pub struct GatedConsumer {
    worker_id: String,
    authority: Arc<dyn Authority>,
    supervisor: ReconnectSupervisor,
    handler: Arc<dyn EventHandler>,
    authority_retry_delay: Duration,
    counters: Counters,
}

impl GatedConsumer {
    pub fn new(
        worker_id: impl Into<String>,
        authority: Arc<dyn Authority>,
        supervisor: ReconnectSupervisor,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            authority,
            supervisor,
            handler,
            authority_retry_delay: DEFAULT_AUTHORITY_RETRY_DELAY,
            counters: Counters::default(),
        }
    }

    /// Set the pause before requeueing when the authority is unreachable
    pub fn authority_retry_delay(mut self, delay: Duration) -> Self {
        self.authority_retry_delay = delay;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            reconnects: self.supervisor.reconnects(),
        }
    }

    /// Consume until shutdown
    ///
    /// Broker failures are absorbed by reconnecting. Shutdown is only
    /// observed between deliveries, so an in-flight event always settles.
    pub async fn run(&self, mut shutdown: Shutdown) -> ConsumerStats {
        let Some(mut channel) = self.supervisor.connect_with_retry(&mut shutdown).await else {
            return self.stats();
        };

        info!(
            worker_id = %self.worker_id,
            queue = %self.supervisor.topology().queue,
            "Waiting for events"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => None,
                delivery = channel.next_delivery() => Some(delivery),
            };

            let failure = match next {
                None => break,
                Some(Ok(delivery)) => {
                    match self.dispatch(DeliveryEnvelope::new(delivery), channel.as_mut()).await {
                        Ok(disposition) => {
                            debug!(worker_id = %self.worker_id, ?disposition, "Delivery settled");
                            continue;
                        }
                        Err(e) => e,
                    }
                }
                Some(Err(e)) => e,
            };

            if failure.is_connection_loss() {
                warn!(worker_id = %self.worker_id, error = %failure, "Broker connection lost");
            } else {
                error!(worker_id = %self.worker_id, error = %failure, "Broker channel failed");
            }

            drop(channel);
            channel = match self.supervisor.reconnect(&mut shutdown).await {
                Some(channel) => channel,
                None => return self.stats(),
            };
            info!(worker_id = %self.worker_id, "Consumer reattached");
        }

        if let Err(e) = channel.close().await {
            debug!(worker_id = %self.worker_id, error = %e, "Error closing consumer channel");
        }
        self.supervisor.close();
        info!(worker_id = %self.worker_id, "Consumer stopped");

        self.stats()
    }

    /// Run one delivery through the gate and settle it
    ///
    /// An error means the settlement itself failed; the broker will
    /// redeliver once the connection is gone.
    pub async fn dispatch(
        &self,
        envelope: DeliveryEnvelope,
        channel: &mut dyn BrokerChannel,
    ) -> Result<Disposition, DeliveryError> {
        let tag = envelope.tag();
        let redelivered = envelope.redelivered();

        let event = match envelope.event().cloned().map_err(Clone::clone) {
            Ok(event) => event,
            Err(e) => {
                warn!(worker_id = %self.worker_id, delivery_tag = tag, error = %e, "Dropping malformed envelope");
                envelope.ack(channel).await?;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(Disposition::DroppedMalformed);
            }
        };

        let Some(token) = event.bearer() else {
            warn!(worker_id = %self.worker_id, delivery_tag = tag, event_type = %event.kind, "Dropping event without token");
            envelope.ack(channel).await?;
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(Disposition::DroppedTokenless);
        };

        let subject = match self.authority.verify(token).await {
            Ok(subject) => subject,
            Err(AuthError::Unreachable(reason)) => {
                warn!(worker_id = %self.worker_id, delivery_tag = tag, error = %reason, "Authority unreachable, requeueing");
                tokio::time::sleep(self.authority_retry_delay).await;
                envelope.nack(channel, true).await?;
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                return Ok(Disposition::Requeued);
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, delivery_tag = tag, error = %e, "Dropping event with rejected token");
                envelope.ack(channel).await?;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(Disposition::DroppedInvalidToken);
            }
        };

        let ctx = DeliveryContext {
            subject,
            redelivered,
            delivery_tag: tag,
            worker_id: self.worker_id.clone(),
        };

        match self.handler.handle(&event, &ctx).await {
            Ok(()) => {
                envelope.ack(channel).await?;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                info!(
                    worker_id = %self.worker_id,
                    subject = %ctx.subject,
                    event_type = %event.kind,
                    redelivered,
                    "Event processed"
                );
                Ok(Disposition::Processed)
            }
            Err(e) => {
                warn!(worker_id = %self.worker_id, delivery_tag = tag, error = %e, "Handler failed, requeueing");
                envelope.nack(channel, true).await?;
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                Ok(Disposition::Requeued)
            }
        }
    }
}
