//! Registration bus for pushing newly appended events to subscriptions.
//!
//! A topic bus keyed by stream id (plus the constant `"$all"` topic). The
//! notification pipeline publishes `Arc`-wrapped event batches so that every
//! subscriber on a topic shares the same heap allocation rather than deep-cloning
//! event data. Delivery is at-most-once and best-effort; subscriptions tolerate
//! missed publications by falling back to catch-up reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::types::RecordedEvent;

/// A batch of events published under one topic, shared across subscribers.
pub type EventBatch = Arc<Vec<RecordedEvent>>;

/// Topic pub/sub keyed by stream id.
///
/// Cloning shares the underlying registry. Publishing prunes subscribers whose
/// receiving side has been dropped, so abandoned subscriptions cost nothing after
/// the next publish on their topic.
#[derive(Clone, Default)]
pub struct RegistrationBus {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<EventBatch>>>>>,
}

impl RegistrationBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll the caller on a topic.
    ///
    /// The returned receiver yields every batch published under `topic` after this
    /// call. Dropping the receiver unenrolls lazily.
    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<EventBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(topic.to_string()).or_default().push(tx);
        rx
    }

    /// Deliver a batch to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers reached. Closed subscribers are pruned.
    pub fn publish(&self, topic: &str, batch: EventBatch) -> usize {
        let mut topics = self.lock();
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };

        subscribers.retain(|tx| tx.send(Arc::clone(&batch)).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscribers currently enrolled on `topic`.
    ///
    /// Counts senders whose receiver has not been dropped; pruning still happens
    /// on publish.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<mpsc::UnboundedSender<EventBatch>>>> {
        self.topics.lock().expect("RegistrationBus mutex poisoned")
    }
}
