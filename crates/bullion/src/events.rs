//! Queue notifications.
//!
//! The transition scripts publish on two channels: `{base}jobs` carries the id
//! of every job that became ready, and `{base}delayed` carries the due time of
//! every job added to the delayed set. Notifications only shorten waits;
//! workers and the promoter always fall back to polling.

use crate::job::JobId;
use crate::keys::QueueKeys;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const SUBSCRIPTION_BUFFER: usize = 256;

/// A decoded queue notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// A job was pushed onto the ready list.
    Ready(JobId),
    /// A job was added to the delayed set and is due at `eta_ms`.
    Delayed { eta_ms: i64 },
}

impl QueueEvent {
    /// Decode a raw pub/sub message for the given queue.
    pub fn decode(keys: &QueueKeys, channel: &str, payload: &str) -> Option<Self> {
        if channel == keys.jobs() {
            payload.parse().ok().map(QueueEvent::Ready)
        } else if channel == keys.delayed() {
            // Older writers publish the score divided by 4096 as a float.
            payload
                .parse::<i64>()
                .ok()
                .or_else(|| payload.parse::<f64>().ok().map(|eta| eta as i64))
                .map(|eta_ms| QueueEvent::Delayed { eta_ms })
        } else {
            None
        }
    }
}

/// Live subscription to a queue's notification channels.
///
/// Dropping the subscription stops the forwarding task.
pub struct Subscription {
    receiver: mpsc::Receiver<QueueEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Forward raw `(channel, payload)` messages as decoded events.
    pub fn spawn<S>(keys: QueueKeys, messages: S) -> Self
    where
        S: Stream<Item = (String, String)> + Send + 'static,
    {
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let task = tokio::spawn(async move {
            let mut messages = Box::pin(messages);
            while let Some((channel, payload)) = messages.next().await {
                let Some(event) = QueueEvent::decode(&keys, &channel, &payload) else {
                    continue;
                };

                // Full buffer means the consumer is busy; it will poll anyway.
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(event) {
                    debug!(queue = %keys.name(), "Subscription receiver dropped");
                    break;
                }
            }
        });

        Self { receiver, task }
    }

    /// Wait for the next event. Returns `None` once the source is gone.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        self.receiver.recv().await
    }

    /// Take an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<QueueEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
