//! Status Relay - per-emergency view of the shared status topic
//!
//! Every subscription gets its own receiver on the unfiltered status topic and
//! yields only the events of one emergency, in arrival order. The sequence ends
//! right after that emergency's `Extinguido`, or with an error when the channel
//! goes away. Dropping the subscription releases its receiver; the shared topic
//! is unaffected.

use bytes::Bytes;
use firewatch_broadcast::{BroadcastChannel, BroadcastError};
use firewatch_core::StatusEvent;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not subscribe to the status topic
    #[error("Broadcast failure: {0}")]
    Broadcast(#[from] BroadcastError),

    /// Status channel closed before the emergency finished
    #[error("Status channel disconnected before {0} was extinguished")]
    Disconnected(String),
}

/// Creates filtered status subscriptions
#[derive(Clone)]
pub struct StatusRelay {
    broadcast: Arc<dyn BroadcastChannel>,
    topic: String,
}

impl StatusRelay {
    /// Create a relay over `topic`
    pub fn new(broadcast: Arc<dyn BroadcastChannel>, topic: impl Into<String>) -> Self {
        Self {
            broadcast,
            topic: topic.into(),
        }
    }

    /// Subscribe to the events of one emergency, from now on
    pub fn subscribe(&self, emergency_name: &str) -> Result<StatusSubscription, RelayError> {
        let rx = self.broadcast.subscribe(&self.topic)?;
        debug!(emergency = %emergency_name, topic = %self.topic, "Status subscription opened");
        Ok(StatusSubscription {
            emergency_name: emergency_name.to_string(),
            rx,
            finished: false,
        })
    }
}

/// Lazy sequence of status events for one emergency
#[derive(Debug)]
pub struct StatusSubscription {
    emergency_name: String,
    rx: broadcast::Receiver<Bytes>,
    finished: bool,
}

impl StatusSubscription {
    /// Emergency this subscription follows
    pub fn emergency_name(&self) -> &str {
        &self.emergency_name
    }

    /// Check if the sequence has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next matching event.
    ///
    /// `None` once `Extinguido` has been yielded or after a disconnection
    /// error has been reported.
    pub async fn next(&mut self) -> Option<Result<StatusEvent, RelayError>> {
        if self.finished {
            return None;
        }

        loop {
            let payload = match self.rx.recv().await {
                Ok(payload) => payload,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        emergency = %self.emergency_name,
                        skipped,
                        "Status subscriber lagged, events skipped"
                    );
                    continue;
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return Some(Err(RelayError::Disconnected(self.emergency_name.clone())));
                }
            };

            let event: StatusEvent = match serde_json::from_slice(&payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(emergency = %self.emergency_name, "Skipping undecodable status payload: {}", e);
                    continue;
                }
            };

            if event.emergency_name != self.emergency_name {
                continue;
            }

            if event.is_terminal() {
                self.finished = true;
            }
            return Some(Ok(event));
        }
    }
}
