//! Broker engine: queue registry, connections, and delivery tracking

use super::queue::{DurableQueue, StoredMessage};
use super::{ConsumerInfo, Delivery, DeliveryTag, QueueInfo, QueueName, QueueOptions};
use crate::error::DeliveryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

struct Unacked {
    queue: Arc<DurableQueue>,
    message: StoredMessage,
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    consuming: Option<Arc<DurableQueue>>,
    prefetch: u16,
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Unacked>,
}

impl ConnectionState {
    fn has_credit(&self) -> bool {
        self.consuming.is_some()
            && (self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch))
    }
}

struct Connection {
    id: u64,
    closed: watch::Sender<bool>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Mark closed, detach the consumer and requeue unacked deliveries
    ///
    /// Returns the number of requeued deliveries. Idempotent.
    fn shutdown(&self) -> usize {
        let (consuming, unacked) = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            (state.consuming.take(), std::mem::take(&mut state.unacked))
        };
        self.closed.send_replace(true);

        if let Some(queue) = consuming {
            queue.detach(self.id);
        }

        // Tags are ascending, so each queue gets its messages back in delivery order
        let requeued = unacked.len();
        let mut by_queue: Vec<(Arc<DurableQueue>, Vec<StoredMessage>)> = Vec::new();
        for Unacked { queue, message } in unacked.into_values() {
            match by_queue.iter_mut().find(|(q, _)| Arc::ptr_eq(q, &queue)) {
                Some((_, messages)) => messages.push(message),
                None => by_queue.push((queue, vec![message])),
            }
        }
        for (queue, messages) in by_queue {
            queue.requeue(messages);
        }

        requeued
    }
}

struct Shared {
    queues: DashMap<QueueName, Arc<DurableQueue>>,
    connections: DashMap<u64, Arc<Connection>>,
    next_connection_id: AtomicU64,
    next_message_id: AtomicU64,
    available: AtomicBool,
}

/// In-process durable broker
///
/// Cheap to clone; clones share the same queues and connections.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queues: DashMap::new(),
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                next_message_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Open a new connection
    pub fn open(&self) -> Result<BrokerSession, DeliveryError> {
        if !self.is_available() {
            return Err(DeliveryError::BrokerUnreachable(
                "broker is not accepting connections".to_string(),
            ));
        }

        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, closed_rx) = watch::channel(false);
        let conn = Arc::new(Connection {
            id,
            closed: closed_tx,
            state: Mutex::new(ConnectionState::default()),
        });
        self.shared.connections.insert(id, conn.clone());

        debug!(connection_id = id, "Broker connection opened");

        Ok(BrokerSession {
            broker: self.clone(),
            conn,
            closed_rx,
        })
    }

    /// Declare a queue; idempotent when the durability matches
    pub fn declare(&self, name: &QueueName, options: QueueOptions) -> Result<QueueInfo, DeliveryError> {
        let queue = match self.shared.queues.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let queue = entry.get().clone();
                if queue.is_durable() != options.durable {
                    return Err(DeliveryError::PreconditionFailed(format!(
                        "queue '{}' already declared with durable={}",
                        name,
                        queue.is_durable()
                    )));
                }
                queue
            }
            Entry::Vacant(entry) => {
                info!(queue = %name, durable = options.durable, "Queue declared");
                entry
                    .insert(Arc::new(DurableQueue::new(name.clone(), options.durable)))
                    .clone()
            }
        };

        Ok(info_of(&queue))
    }

    pub fn queue_info(&self, name: &QueueName) -> Option<QueueInfo> {
        self.shared.queues.get(name).map(|q| info_of(q.value()))
    }

    /// Append a message; returns the broker-assigned message id
    pub fn publish(
        &self,
        name: &QueueName,
        body: Vec<u8>,
        persistent: bool,
    ) -> Result<u64, DeliveryError> {
        let queue = self.queue(name)?;
        let id = self.shared.next_message_id.fetch_add(1, Ordering::Relaxed);

        queue.push(StoredMessage {
            id,
            body,
            persistent,
            redelivered: false,
        });

        trace!(queue = %name, message_id = id, persistent, "Message enqueued");
        Ok(id)
    }

    /// Consumers attached to a queue, with their current unacked counts
    pub fn consumers(&self, name: &QueueName) -> Vec<ConsumerInfo> {
        let Some(queue) = self.shared.queues.get(name).map(|q| q.value().clone()) else {
            return Vec::new();
        };

        queue
            .consumers()
            .into_iter()
            .map(|mut info| {
                if let Some(conn) = self.shared.connections.get(&info.connection_id) {
                    info.unacked = conn.state.lock().unacked.len();
                }
                info
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Force-close every open connection; returns how many were closed
    pub fn drop_connections(&self) -> usize {
        let ids: Vec<u64> = self.shared.connections.iter().map(|c| *c.key()).collect();
        let count = ids.len();
        for id in ids {
            self.close_connection(id);
        }

        if count > 0 {
            warn!(connections = count, "Dropped all broker connections");
        }
        count
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        info!(available, "Broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }

    /// Behave as if the broker process restarted
    ///
    /// Every connection is closed (unacked deliveries are requeued first),
    /// then non-durable queues and non-persistent messages are discarded.
    pub fn simulate_restart(&self) {
        let connections = self.drop_connections();

        let before = self.shared.queues.len();
        self.shared.queues.retain(|_, queue| queue.is_durable());
        let queues_lost = before - self.shared.queues.len();

        let messages_lost: usize = self
            .shared
            .queues
            .iter()
            .map(|queue| queue.retain_persistent())
            .sum();

        warn!(
            connections,
            queues_lost, messages_lost, "Broker restarted"
        );
    }

    fn queue(&self, name: &QueueName) -> Result<Arc<DurableQueue>, DeliveryError> {
        self.shared
            .queues
            .get(name)
            .map(|q| q.value().clone())
            .ok_or_else(|| DeliveryError::QueueNotFound(name.to_string()))
    }

    fn close_connection(&self, id: u64) {
        let Some((_, conn)) = self.shared.connections.remove(&id) else {
            return;
        };

        let requeued = conn.shutdown();
        if requeued > 0 {
            info!(connection_id = id, requeued, "Connection closed, unacked deliveries requeued");
        } else {
            debug!(connection_id = id, "Connection closed");
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn info_of(queue: &DurableQueue) -> QueueInfo {
    QueueInfo {
        name: queue.name().clone(),
        durable: queue.is_durable(),
        message_count: queue.len(),
        consumer_count: queue.consumer_count(),
    }
}

/// One open connection to the engine
///
/// Dropping the session closes the connection.
pub struct BrokerSession {
    broker: Broker,
    conn: Arc<Connection>,
    closed_rx: watch::Receiver<bool>,
}

impl BrokerSession {
    pub fn id(&self) -> u64 {
        self.conn.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    /// A receiver that flips to `true` once this connection is closed
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn declare(&self, queue: &QueueName, options: QueueOptions) -> Result<QueueInfo, DeliveryError> {
        self.ensure_open()?;
        self.broker.declare(queue, options)
    }

    pub fn publish(&self, queue: &QueueName, body: Vec<u8>, persistent: bool) -> Result<(), DeliveryError> {
        self.ensure_open()?;
        self.broker.publish(queue, body, persistent).map(|_| ())
    }

    /// Attach this connection as a consumer of `queue`
    ///
    /// Calling again on the same queue updates the prefetch.
    pub fn consume(&mut self, queue: &QueueName, prefetch: u16) -> Result<(), DeliveryError> {
        self.ensure_open()?;
        let target = self.broker.queue(queue)?;

        {
            let mut state = self.conn.state.lock();
            // Shutdown takes the consumer under this lock, so attaching here
            // cannot outlive a concurrent close
            if state.closed {
                return Err(closed_error());
            }
            if let Some(current) = &state.consuming {
                if current.name() != queue {
                    return Err(DeliveryError::PreconditionFailed(format!(
                        "connection already consuming from '{}'",
                        current.name()
                    )));
                }
            }
            state.consuming = Some(target.clone());
            state.prefetch = prefetch;
            target.attach(self.conn.id, prefetch);
        }

        info!(connection_id = self.conn.id, queue = %queue, prefetch, "Consumer attached");
        Ok(())
    }

    /// Whether another delivery may be handed out before something is settled
    pub fn has_credit(&self) -> bool {
        self.conn.state.lock().has_credit()
    }

    /// Wait for the next message on the consumed queue
    ///
    /// Fails immediately when nothing is consumed or the prefetch window is
    /// full. Cancel-safe.
    pub async fn next_delivery(&mut self) -> Result<Delivery, DeliveryError> {
        loop {
            let queue = {
                let state = self.conn.state.lock();
                if state.closed {
                    return Err(closed_error());
                }
                let Some(queue) = state.consuming.clone() else {
                    return Err(DeliveryError::PreconditionFailed(
                        "no consumer on this connection".to_string(),
                    ));
                };
                if !state.has_credit() {
                    return Err(DeliveryError::PreconditionFailed(
                        "prefetch window exhausted".to_string(),
                    ));
                }
                queue
            };

            let notified = queue.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = queue.pop() {
                return self.track(queue.clone(), message);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed_rx.changed() => {}
            }
        }
    }

    pub fn ack(&mut self, tag: DeliveryTag) -> Result<(), DeliveryError> {
        let unacked = self.settle(tag)?;
        trace!(connection_id = self.conn.id, delivery_tag = tag, message_id = unacked.message.id, "Acked");
        Ok(())
    }

    pub fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), DeliveryError> {
        let Unacked { queue, message } = self.settle(tag)?;
        if requeue {
            debug!(connection_id = self.conn.id, delivery_tag = tag, queue = %queue.name(), "Nacked, requeued");
            queue.requeue(vec![message]);
        } else {
            debug!(connection_id = self.conn.id, delivery_tag = tag, queue = %queue.name(), "Nacked, discarded");
        }
        Ok(())
    }

    /// Close the connection (idempotent)
    pub fn close(&mut self) {
        self.broker.close_connection(self.conn.id);
    }

    fn ensure_open(&self) -> Result<(), DeliveryError> {
        if self.conn.state.lock().closed {
            return Err(closed_error());
        }
        Ok(())
    }

    fn track(&self, queue: Arc<DurableQueue>, message: StoredMessage) -> Result<Delivery, DeliveryError> {
        let mut state = self.conn.state.lock();
        if state.closed {
            drop(state);
            queue.restore(message);
            return Err(closed_error());
        }

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            redelivered: message.redelivered,
            body: message.body.clone(),
        };
        state.unacked.insert(tag, Unacked { queue, message });

        Ok(delivery)
    }

    fn settle(&self, tag: DeliveryTag) -> Result<Unacked, DeliveryError> {
        let mut state = self.conn.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        state
            .unacked
            .remove(&tag)
            .ok_or_else(|| DeliveryError::PreconditionFailed(format!("unknown delivery tag {tag}")))
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> DeliveryError {
    DeliveryError::BrokerUnreachable("connection closed".to_string())
}
