//! # Broadcast channel for Firewatch event topics.
//!
//! [`BroadcastChannel`] is the publish/subscribe accessor used by the dispatch
//! pipeline. Payloads are opaque bytes (JSON in practice) published to named
//! topics; every subscriber of a topic receives its own copy.
//!
//! [`LocalBroadcast`] is the in-process implementation: one
//! [`tokio::sync::broadcast`] ring buffer per topic, created on first use.
//!
//! ## Rules
//! - **Non-blocking publish**: `publish()` never waits for subscribers.
//! - **Subscribe-from-now**: a receiver only sees messages sent after it subscribed.
//! - **No persistence**: messages published to a topic without subscribers are dropped.
//! - **Lag handling**: slow receivers get `RecvError::Lagged(n)` and skip `n` oldest items.
//! - **Close**: after [`LocalBroadcast::close`], publishes fail and receivers observe
//!   `RecvError::Closed` once drained.

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// Message body carried on a topic
pub type Payload = Bytes;

/// Broadcast channel errors
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Channel has been shut down
    #[error("Broadcast channel closed")]
    Closed,

    /// Channel state cannot be reached
    #[error("Broadcast channel unavailable: {0}")]
    Unavailable(String),

    /// Value could not be encoded as JSON
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publish/subscribe over named topics.
pub trait BroadcastChannel: Send + Sync {
    /// Publish a payload, returning how many subscribers will see it
    fn publish(&self, topic: &str, payload: Payload) -> Result<usize, BroadcastError>;

    /// Subscribe to all payloads published on `topic` from now on
    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Payload>, BroadcastError>;
}

/// Serialize `value` as JSON and publish it
pub fn publish_json<T: Serialize>(
    channel: &dyn BroadcastChannel,
    topic: &str,
    value: &T,
) -> Result<usize, BroadcastError> {
    let body = serde_json::to_vec(value)?;
    channel.publish(topic, Bytes::from(body))
}

/// In-process broadcast channel, one ring buffer per topic.
#[derive(Debug)]
pub struct LocalBroadcast {
    topics: RwLock<HashMap<String, broadcast::Sender<Payload>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl LocalBroadcast {
    /// Create a channel whose topics each buffer `capacity` messages.
    ///
    /// The minimum capacity is 1 (clamped).
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .ok()
            .and_then(|topics| topics.get(topic).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }

    /// Shut the channel down.
    ///
    /// Drops every topic sender; existing receivers drain what is buffered and
    /// then observe `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut topics) = self.topics.write() {
            topics.clear();
        }
        debug!("Broadcast channel closed");
    }

    /// Check if the channel has been shut down
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> Result<broadcast::Sender<Payload>, BroadcastError> {
        if self.is_closed() {
            return Err(BroadcastError::Closed);
        }

        if let Some(tx) = self
            .topics
            .read()
            .map_err(|e| BroadcastError::Unavailable(format!("Lock error: {}", e)))?
            .get(topic)
        {
            return Ok(tx.clone());
        }

        let mut topics = self
            .topics
            .write()
            .map_err(|e| BroadcastError::Unavailable(format!("Lock error: {}", e)))?;
        if self.is_closed() {
            return Err(BroadcastError::Closed);
        }
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic, capacity = self.capacity, "Topic created");
                broadcast::channel(self.capacity).0
            })
            .clone();
        Ok(tx)
    }
}

impl Default for LocalBroadcast {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl BroadcastChannel for LocalBroadcast {
    fn publish(&self, topic: &str, payload: Payload) -> Result<usize, BroadcastError> {
        let tx = self.sender(topic)?;
        // No receivers is not an error: the message is simply dropped
        Ok(tx.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Payload>, BroadcastError> {
        Ok(self.sender(topic)?.subscribe())
    }
}
