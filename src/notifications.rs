//! Notification pipeline: turns database append notifications into per-stream
//! event batches on the registration bus.
//!
//! Three stages with back-pressured hand-offs:
//!
//! 1. **Listener** owns the dedicated notify session and parses each payload
//!    (`"stream_id,from,to"`) into an [`AppendNotification`].
//! 2. **Reader** fetches the notified range from storage.
//! 3. **Broadcaster** publishes the batch on the bus under the stream's own topic
//!    and under `"$all"`.
//!
//! The pipeline runs at most once per cluster: it holds the advisory lock at
//! [`PIPELINE_LOCK_KEY`] while leading, retries while another node leads, and
//! tears down and re-elects when the lock is lost. Losing the listener session
//! loses no events -- the database is authoritative and subscriptions recover via
//! catch-up reads on their next acknowledgement.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::bus::{EventBatch, RegistrationBus};
use crate::error::{Error, Result};
use crate::locks::AdvisoryLocks;
use crate::storage::Storage;
use crate::types::ALL_STREAM;

/// Name of the single notification channel appends publish on.
pub const NOTIFICATION_CHANNEL: &str = "eventwell_events";

/// Advisory-lock key reserved for pipeline leadership. Subscription ids are
/// assigned from 1, so key 0 is never contended by them.
pub const PIPELINE_LOCK_KEY: i64 = 0;

/// Bound on each stage hand-off channel.
const STAGE_CAPACITY: usize = 256;

/// Delay before re-opening the notify session after it fails.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A parsed append notification: a contiguous range of newly committed positions
/// in one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendNotification {
    /// Stream the append targeted.
    pub stream_id: String,
    /// First newly appended position (one-based, inclusive).
    pub from: i64,
    /// Last newly appended position (inclusive).
    pub to: i64,
}

impl FromStr for AppendNotification {
    type Err = Error;

    /// Parse a `"stream_id,from,to"` payload.
    ///
    /// Splits from the right so stream ids containing commas survive.
    fn from_str(payload: &str) -> Result<Self> {
        let mut parts = payload.rsplitn(3, ',');
        let to = parts
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| Error::InvalidNotification(payload.to_string()))?;
        let from = parts
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or_else(|| Error::InvalidNotification(payload.to_string()))?;
        let stream_id = parts
            .next()
            .filter(|stream| !stream.is_empty())
            .ok_or_else(|| Error::InvalidNotification(payload.to_string()))?;

        if from < 1 || from > to {
            return Err(Error::InvalidNotification(payload.to_string()));
        }

        Ok(Self {
            stream_id: stream_id.to_string(),
            from,
            to,
        })
    }
}

/// A dedicated session receiving append notifications.
///
/// Implementations block in `recv` until a notification arrives. A returned error
/// means the session is gone; the listener stage re-opens a fresh source.
#[async_trait]
pub trait NotificationSource: Send {
    /// Wait for the next append notification.
    async fn recv(&mut self) -> Result<AppendNotification>;
}

/// Handle to the running pipeline.
pub(crate) struct NotificationPipeline {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl NotificationPipeline {
    /// Stop the pipeline, releasing leadership if held.
    pub(crate) async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.join.await;
    }
}

/// Spawn the pipeline supervisor task.
///
/// `retry_interval` paces leadership attempts while another node holds the
/// pipeline lock.
pub(crate) fn spawn_pipeline(
    storage: Arc<dyn Storage>,
    bus: RegistrationBus,
    locks: AdvisoryLocks,
    retry_interval: Duration,
) -> NotificationPipeline {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let join = tokio::spawn(run_pipeline(storage, bus, locks, retry_interval, shutdown_rx));
    NotificationPipeline {
        shutdown: Some(shutdown_tx),
        join,
    }
}

async fn run_pipeline(
    storage: Arc<dyn Storage>,
    bus: RegistrationBus,
    locks: AdvisoryLocks,
    retry_interval: Duration,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        // Elect: at most one pipeline leads per cluster.
        let (lock_events_tx, mut lock_events_rx) = mpsc::unbounded_channel();
        let lock_ref = loop {
            tokio::select! {
                _ = &mut shutdown_rx => return,
                acquired = locks.try_acquire(PIPELINE_LOCK_KEY, lock_events_tx.clone()) => {
                    match acquired {
                        Ok(lock_ref) => break lock_ref,
                        Err(e) => {
                            tracing::trace!(error = %e, "pipeline leadership unavailable");
                            tokio::time::sleep(retry_interval).await;
                        }
                    }
                }
            }
        };
        tracing::info!("notification pipeline leading");

        let (range_tx, range_rx) = mpsc::channel(STAGE_CAPACITY);
        let (batch_tx, batch_rx) = mpsc::channel(STAGE_CAPACITY);
        let listener = tokio::spawn(run_listener(Arc::clone(&storage), range_tx));
        let reader = tokio::spawn(run_reader(Arc::clone(&storage), range_rx, batch_tx));
        let broadcaster = tokio::spawn(run_broadcaster(bus.clone(), batch_rx));

        let shutting_down = tokio::select! {
            _ = &mut shutdown_rx => true,
            _ = lock_events_rx.recv() => {
                tracing::warn!("notification pipeline lost leadership");
                false
            }
        };

        listener.abort();
        reader.abort();
        broadcaster.abort();
        // Wait the stages out so their sessions and channels are actually gone
        // before leadership is released or re-contested.
        let _ = listener.await;
        let _ = reader.await;
        let _ = broadcaster.await;

        if shutting_down {
            locks.release(lock_ref);
            return;
        }
        // Lock already gone; loop around and stand for election again.
    }
}

/// Stage 1: own the notify session, parse payloads, hand ranges downstream.
async fn run_listener(storage: Arc<dyn Storage>, range_tx: mpsc::Sender<AppendNotification>) {
    loop {
        let mut source = match storage.notification_source().await {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(error = %e, "notify session unavailable, retrying");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };
        tracing::debug!(channel = NOTIFICATION_CHANNEL, "listening for append notifications");

        loop {
            match source.recv().await {
                Ok(notification) => {
                    counter!("eventwell_notifications_total").increment(1);
                    if range_tx.send(notification).await.is_err() {
                        // Pipeline torn down.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "notify session lost, reconnecting");
                    break;
                }
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

/// Stage 2: read the notified range back from storage.
async fn run_reader(
    storage: Arc<dyn Storage>,
    mut range_rx: mpsc::Receiver<AppendNotification>,
    batch_tx: mpsc::Sender<(String, EventBatch)>,
) {
    while let Some(notification) = range_rx.recv().await {
        let count = notification.to - notification.from + 1;
        match storage
            .read_stream_forward(&notification.stream_id, notification.from, count)
            .await
        {
            Ok(events) if events.is_empty() => {
                tracing::debug!(
                    stream_id = %notification.stream_id,
                    from = notification.from,
                    "notified range returned no events"
                );
            }
            Ok(events) => {
                if batch_tx
                    .send((notification.stream_id, Arc::new(events)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            // Not fatal: affected subscriptions fall behind and catch up from
            // storage on their next acknowledgement.
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    stream_id = %notification.stream_id,
                    "failed to read notified range"
                );
            }
        }
    }
}

/// Stage 3: publish under the stream topic and the `$all` topic.
async fn run_broadcaster(bus: RegistrationBus, mut batch_rx: mpsc::Receiver<(String, EventBatch)>) {
    while let Some((stream_id, batch)) = batch_rx.recv().await {
        counter!("eventwell_events_broadcast_total").increment(batch.len() as u64);
        bus.publish(&stream_id, Arc::clone(&batch));
        bus.publish(ALL_STREAM, batch);
    }
}
