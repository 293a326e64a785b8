//! A single named queue: ready messages and attached consumers

use super::{ConsumerInfo, QueueName};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Notify;

/// A message held by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredMessage {
    pub id: u64,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// connection id -> prefetch
    consumers: BTreeMap<u64, u16>,
}

#[derive(Debug)]
pub(crate) struct DurableQueue {
    name: QueueName,
    durable: bool,
    state: Mutex<QueueState>,
    /// Woken whenever a message becomes ready
    ready: Notify,
}

impl DurableQueue {
    pub fn new(name: QueueName, durable: bool) -> Self {
        Self {
            name,
            durable,
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn notify(&self) -> &Notify {
        &self.ready
    }

    /// Append to the tail
    pub fn push(&self, message: StoredMessage) {
        self.state.lock().ready.push_back(message);
        self.ready.notify_waiters();
    }

    /// Put messages back at the head, keeping their relative order
    pub fn requeue(&self, messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock();
            for mut message in messages.into_iter().rev() {
                message.redelivered = true;
                state.ready.push_front(message);
            }
        }
        self.ready.notify_waiters();
    }

    /// Return a message that was popped but never handed out
    pub fn restore(&self, message: StoredMessage) {
        self.state.lock().ready.push_front(message);
        self.ready.notify_waiters();
    }

    pub fn pop(&self) -> Option<StoredMessage> {
        self.state.lock().ready.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn attach(&self, connection_id: u64, prefetch: u16) {
        self.state.lock().consumers.insert(connection_id, prefetch);
    }

    pub fn detach(&self, connection_id: u64) {
        self.state.lock().consumers.remove(&connection_id);
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Attached consumers; `unacked` is filled in by the engine
    pub fn consumers(&self) -> Vec<ConsumerInfo> {
        self.state
            .lock()
            .consumers
            .iter()
            .map(|(&connection_id, &prefetch)| ConsumerInfo {
                connection_id,
                prefetch,
                unacked: 0,
            })
            .collect()
    }

    /// Drop transient messages (broker restart); returns how many were lost
    pub fn retain_persistent(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.ready.len();
        state.ready.retain(|m| m.persistent);
        before - state.ready.len()
    }
}
