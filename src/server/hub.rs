//! Per-agent output fan-out.
//!
//! The hub owns one [`OutputBuffer`] and one subscriber set per agent.
//! Publishing appends to the buffer and hands a copy of the message to every
//! subscriber queue. Subscribers are removed when their [`Subscription`] is
//! dropped, or at publish time when their queue is closed or full. A
//! subscriber dropped for a full queue is flagged as lagged so its reader can
//! tell that apart from a normal close.

use super::buffer::OutputBuffer;
use crate::protocol::OutputMessage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Queue depth per subscriber before it is considered lagging.
pub const SUBSCRIBER_QUEUE: usize = 1024;

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<OutputMessage>,
    lagged: Arc<AtomicBool>,
}

#[derive(Debug)]
struct Channel {
    buffer: OutputBuffer,
    subscribers: HashMap<u64, Subscriber>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: OutputBuffer::new(capacity),
            subscribers: HashMap::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.buffer.is_empty() && self.subscribers.is_empty()
    }
}

#[derive(Debug, Default)]
struct Channels {
    next_id: u64,
    by_agent: HashMap<String, Channel>,
}

fn lock(channels: &Mutex<Channels>) -> MutexGuard<'_, Channels> {
    channels.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared output buffers and subscriber sets, keyed by agent id.
#[derive(Debug, Clone)]
pub struct OutputHub {
    channels: Arc<Mutex<Channels>>,
    capacity: usize,
}

impl OutputHub {
    /// Create a hub whose per-agent buffers keep `capacity` messages.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(Channels::default())),
            capacity,
        }
    }

    /// Buffer a message for `agent_id` and deliver it to all subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, agent_id: &str, message: OutputMessage) -> usize {
        let mut channels = lock(&self.channels);
        let capacity = self.capacity;
        let channel = channels
            .by_agent
            .entry(agent_id.to_string())
            .or_insert_with(|| Channel::new(capacity));

        channel.buffer.push(message.clone());
        channel.subscribers.retain(|id, sub| match sub.tx.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%agent_id, subscriber = id, "Subscriber lagging, dropping it");
                sub.lagged.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%agent_id, subscriber = id, "Subscriber gone");
                false
            }
        });
        channel.subscribers.len()
    }

    /// Up to the last `limit` buffered messages for an agent, oldest first.
    #[must_use]
    pub fn history(&self, agent_id: &str, limit: usize) -> Vec<OutputMessage> {
        lock(&self.channels)
            .by_agent
            .get(agent_id)
            .map(|c| c.buffer.tail(limit))
            .unwrap_or_default()
    }

    /// Register a live subscriber.
    #[must_use]
    pub fn subscribe(&self, agent_id: &str) -> Subscription {
        self.subscribe_with_history(agent_id, 0).1
    }

    /// Snapshot the history and register a subscriber in one step.
    ///
    /// Both happen under the same lock, so every message published afterwards
    /// arrives on the subscription and none of them is also in the snapshot.
    #[must_use]
    pub fn subscribe_with_history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> (Vec<OutputMessage>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut channels = lock(&self.channels);
        let id = channels.next_id;
        channels.next_id += 1;

        let capacity = self.capacity;
        let channel = channels
            .by_agent
            .entry(agent_id.to_string())
            .or_insert_with(|| Channel::new(capacity));
        let history = channel.buffer.tail(limit);
        let lagged = Arc::new(AtomicBool::new(false));
        channel.subscribers.insert(
            id,
            Subscriber {
                tx,
                lagged: Arc::clone(&lagged),
            },
        );
        debug!(%agent_id, subscriber = id, "Subscribed");

        let subscription = Subscription {
            agent_id: agent_id.to_string(),
            id,
            rx,
            lagged,
            channels: Arc::downgrade(&self.channels),
        };
        (history, subscription)
    }

    /// Drop the buffered history of an agent. Subscribers stay registered.
    pub fn clear(&self, agent_id: &str) {
        let mut channels = lock(&self.channels);
        if let Some(channel) = channels.by_agent.get_mut(agent_id) {
            channel.buffer.clear();
            if channel.is_idle() {
                channels.by_agent.remove(agent_id);
            }
        }
    }

    /// Number of live subscribers for an agent.
    #[must_use]
    pub fn subscriber_count(&self, agent_id: &str) -> usize {
        lock(&self.channels)
            .by_agent
            .get(agent_id)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Disconnect every subscriber of every agent.
    ///
    /// Pending `recv` calls return `None` once queued messages are drained.
    pub fn close_all(&self) {
        let mut channels = lock(&self.channels);
        for channel in channels.by_agent.values_mut() {
            channel.subscribers.clear();
        }
        channels.by_agent.retain(|_, c| !c.is_idle());
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A live registration for one agent's output.
///
/// Dropping it removes the subscriber from the hub.
#[derive(Debug)]
pub struct Subscription {
    agent_id: String,
    id: u64,
    rx: mpsc::Receiver<OutputMessage>,
    lagged: Arc<AtomicBool>,
    channels: Weak<Mutex<Channels>>,
}

impl Subscription {
    /// Wait for the next message. `None` once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<OutputMessage> {
        self.rx.recv().await
    }

    /// Whether the hub dropped this subscriber because its queue was full.
    ///
    /// Messages queued before the drop are still delivered by [`recv`](Self::recv).
    #[must_use]
    pub fn is_lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let mut channels = lock(&channels);
        if let Some(channel) = channels.by_agent.get_mut(&self.agent_id) {
            channel.subscribers.remove(&self.id);
            if channel.is_idle() {
                channels.by_agent.remove(&self.agent_id);
            }
        }
        debug!(agent_id = %self.agent_id, subscriber = self.id, "Unsubscribed");
    }
}
