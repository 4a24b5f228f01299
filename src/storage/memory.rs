//! In-memory implementation of the storage gateway.
//!
//! Backs the full [`Storage`] contract with process-local state: an events vector,
//! a per-stream position index, subscription rows, and an advisory-lock table keyed
//! by session. Multiple [`MemoryStorage`] instances can share one [`MemoryBackend`]
//! to emulate several service nodes against the same database, which is how leader
//! failover is exercised in tests.
//!
//! Append notifications are fanned out over a `tokio::broadcast` channel standing
//! in for the database's notify channel; they can be suppressed to simulate
//! notification loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::notifications::{AppendNotification, NotificationSource};
use crate::storage::{LockSession, Storage, SubscriptionRow, validate_events};
use crate::types::{ALL_STREAM, ExpectedVersion, ProposedEvent, RecordedEvent, StartFrom};

/// Capacity of the broadcast channel carrying append notifications.
const NOTIFY_CAPACITY: usize = 1_024;

#[derive(Default)]
struct StreamEntry {
    /// Internal row id.
    id: i64,
    /// Indexes into the global events vector, in stream-version order.
    positions: Vec<usize>,
}

struct SessionEntry {
    /// Which storage instance opened the session (used by the kill switch).
    instance: u64,
    alive: bool,
}

#[derive(Default)]
struct BackendInner {
    events: Vec<RecordedEvent>,
    streams: HashMap<String, StreamEntry>,
    next_stream_id: i64,
    subscriptions: HashMap<(String, String), SubscriptionRow>,
    next_subscription_id: i64,
    /// Advisory locks: key -> owning session id.
    locks: HashMap<i64, u64>,
    sessions: HashMap<u64, SessionEntry>,
    next_session_id: u64,
    schema_created: bool,
    suppress_notifications: bool,
}

/// Shared state standing in for the database.
pub struct MemoryBackend {
    inner: Mutex<BackendInner>,
    notify_tx: broadcast::Sender<AppendNotification>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Arc<Self> {
        let (notify_tx, _rx) = broadcast::channel(NOTIFY_CAPACITY);
        Arc::new(Self {
            inner: Mutex::new(BackendInner {
                next_subscription_id: 1,
                next_stream_id: 1,
                ..Default::default()
            }),
            notify_tx,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendInner> {
        self.inner.lock().expect("MemoryBackend mutex poisoned")
    }

    /// Release every advisory lock held by `session_id` and forget the session.
    fn end_session(&self, session_id: u64) {
        let mut inner = self.lock();
        inner.locks.retain(|_, owner| *owner != session_id);
        inner.sessions.remove(&session_id);
    }
}

/// In-memory [`Storage`] over a (possibly shared) [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryStorage {
    backend: Arc<MemoryBackend>,
    /// Distinguishes the node this instance represents, so the kill switch can
    /// target one node's sessions.
    instance: u64,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

impl MemoryStorage {
    /// Create a storage over a fresh backend.
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    /// Create a storage sharing an existing backend (a second "node" against the
    /// same database).
    pub fn with_backend(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The shared backend.
    pub fn backend(&self) -> Arc<MemoryBackend> {
        Arc::clone(&self.backend)
    }

    /// Suppress (or restore) append notifications, simulating a lost notify
    /// channel.
    pub fn suppress_notifications(&self, suppress: bool) {
        self.backend.lock().suppress_notifications = suppress;
    }

    /// Number of live notification receivers (i.e. attached listener stages).
    pub fn notification_receiver_count(&self) -> usize {
        self.backend.notify_tx.receiver_count()
    }

    /// Kill every lock session opened through this storage instance, releasing
    /// its advisory locks, as if the node's database session dropped.
    pub fn kill_lock_sessions(&self) {
        let mut inner = self.backend.lock();
        let dead: Vec<u64> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.instance == self.instance)
            .map(|(id, _)| *id)
            .collect();
        for session_id in dead {
            if let Some(session) = inner.sessions.get_mut(&session_id) {
                session.alive = false;
            }
            inner.locks.retain(|_, owner| *owner != session_id);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialize(&self) -> Result<bool> {
        let mut inner = self.backend.lock();
        let created = !inner.schema_created;
        inner.schema_created = true;
        Ok(created)
    }

    async fn create_stream(&self, stream_id: &str) -> Result<i64> {
        if stream_id.is_empty() || stream_id == ALL_STREAM {
            return Err(Error::InvalidArgument(format!(
                "cannot create stream {stream_id:?}"
            )));
        }
        let mut inner = self.backend.lock();
        if inner.streams.contains_key(stream_id) {
            return Err(Error::StreamExists {
                stream_id: stream_id.to_string(),
            });
        }
        let id = inner.next_stream_id;
        inner.next_stream_id += 1;
        inner.streams.insert(
            stream_id.to_string(),
            StreamEntry {
                id,
                positions: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn append_events(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>> {
        if stream_id.is_empty() || stream_id == ALL_STREAM {
            return Err(Error::InvalidArgument(format!(
                "cannot append to stream {stream_id:?}"
            )));
        }
        if events.is_empty() {
            return Err(Error::InvalidArgument("no events to append".into()));
        }
        validate_events(&events)?;

        let (recorded, notification) = {
            let mut inner = self.backend.lock();

            let exists = inner.streams.contains_key(stream_id);
            let current = inner
                .streams
                .get(stream_id)
                .map(|s| s.positions.len() as i64)
                .unwrap_or(0);

            match expected_version {
                ExpectedVersion::Any => {}
                ExpectedVersion::NoStream if exists => {
                    return Err(Error::WrongExpectedVersion {
                        stream_id: stream_id.to_string(),
                        expected: "no stream".into(),
                        actual: current.to_string(),
                    });
                }
                ExpectedVersion::NoStream => {}
                ExpectedVersion::Exact(_) if !exists => {
                    return Err(Error::StreamNotFound {
                        stream_id: stream_id.to_string(),
                    });
                }
                ExpectedVersion::Exact(expected) if expected != current => {
                    return Err(Error::WrongExpectedVersion {
                        stream_id: stream_id.to_string(),
                        expected: expected.to_string(),
                        actual: current.to_string(),
                    });
                }
                ExpectedVersion::Exact(_) => {}
            }

            if !exists {
                let id = inner.next_stream_id;
                inner.next_stream_id += 1;
                inner.streams.insert(
                    stream_id.to_string(),
                    StreamEntry {
                        id,
                        positions: Vec::new(),
                    },
                );
            }

            let mut recorded = Vec::with_capacity(events.len());
            for (offset, event) in events.into_iter().enumerate() {
                let position = inner.events.len();
                let recorded_event = RecordedEvent {
                    event_id: event.event_id,
                    event_number: position as i64 + 1,
                    stream_id: stream_id.to_string(),
                    stream_version: current + 1 + offset as i64,
                    event_type: event.event_type,
                    metadata: event.metadata,
                    payload: event.payload,
                    created_at: Utc::now(),
                };
                inner.events.push(recorded_event.clone());
                inner
                    .streams
                    .get_mut(stream_id)
                    .expect("stream entry just ensured")
                    .positions
                    .push(position);
                recorded.push(recorded_event);
            }

            let notification = (!inner.suppress_notifications).then(|| AppendNotification {
                stream_id: stream_id.to_string(),
                from: current + 1,
                to: current + recorded.len() as i64,
            });

            (recorded, notification)
        };

        if let Some(notification) = notification {
            // Publishing to a channel with no receivers is expected before the
            // pipeline starts.
            let _ = self.notify_tx().send(notification);
        }

        Ok(recorded)
    }

    async fn read_stream_forward(
        &self,
        stream_id: &str,
        from: i64,
        max_count: i64,
    ) -> Result<Vec<RecordedEvent>> {
        let inner = self.backend.lock();
        let max = max_count.max(0) as usize;

        if stream_id == ALL_STREAM {
            let start = (from.max(1) - 1) as usize;
            let end = (start + max).min(inner.events.len());
            if start >= inner.events.len() {
                return Ok(Vec::new());
            }
            return Ok(inner.events[start..end].to_vec());
        }

        let Some(entry) = inner.streams.get(stream_id) else {
            return Err(Error::StreamNotFound {
                stream_id: stream_id.to_string(),
            });
        };
        let start = (from.max(1) - 1) as usize;
        let end = (start + max).min(entry.positions.len());
        if start >= entry.positions.len() {
            return Ok(Vec::new());
        }
        Ok(entry.positions[start..end]
            .iter()
            .map(|&position| inner.events[position].clone())
            .collect())
    }

    async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        subscription_name: &str,
        start_from: StartFrom,
    ) -> Result<SubscriptionRow> {
        let mut inner = self.backend.lock();
        let key = (stream_id.to_string(), subscription_name.to_string());
        if let Some(row) = inner.subscriptions.get(&key) {
            return Ok(*row);
        }

        let start = match start_from {
            StartFrom::Origin => 0,
            StartFrom::Exact(position) => (position - 1).max(0),
            StartFrom::Current if stream_id == ALL_STREAM => inner.events.len() as i64,
            StartFrom::Current => inner
                .streams
                .get(stream_id)
                .map(|s| s.positions.len() as i64)
                .unwrap_or(0),
        };

        let row = SubscriptionRow {
            subscription_id: inner.next_subscription_id,
            last_seen: start,
        };
        inner.next_subscription_id += 1;
        inner.subscriptions.insert(key, row);
        Ok(row)
    }

    async fn ack_last_seen_event(
        &self,
        stream_id: &str,
        subscription_name: &str,
        last_seen: i64,
    ) -> Result<()> {
        let mut inner = self.backend.lock();
        let key = (stream_id.to_string(), subscription_name.to_string());
        if let Some(row) = inner.subscriptions.get_mut(&key)
            && row.last_seen <= last_seen
        {
            row.last_seen = last_seen;
        }
        Ok(())
    }

    async fn delete_subscription(&self, stream_id: &str, subscription_name: &str) -> Result<()> {
        let mut inner = self.backend.lock();
        inner
            .subscriptions
            .remove(&(stream_id.to_string(), subscription_name.to_string()));
        Ok(())
    }

    async fn lock_session(&self) -> Result<Box<dyn LockSession>> {
        let mut inner = self.backend.lock();
        let session_id = inner.next_session_id;
        inner.next_session_id += 1;
        inner.sessions.insert(
            session_id,
            SessionEntry {
                instance: self.instance,
                alive: true,
            },
        );
        Ok(Box::new(MemoryLockSession {
            backend: Arc::clone(&self.backend),
            session_id,
        }))
    }

    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>> {
        Ok(Box::new(MemoryNotificationSource {
            rx: self.notify_tx().subscribe(),
            _backend: Arc::clone(&self.backend),
        }))
    }
}

impl MemoryStorage {
    fn notify_tx(&self) -> &broadcast::Sender<AppendNotification> {
        &self.backend.notify_tx
    }
}

/// Advisory-lock session against the shared backend.
struct MemoryLockSession {
    backend: Arc<MemoryBackend>,
    session_id: u64,
}

impl MemoryLockSession {
    fn check_alive(inner: &BackendInner, session_id: u64) -> Result<()> {
        match inner.sessions.get(&session_id) {
            Some(session) if session.alive => Ok(()),
            _ => Err(Error::Connection("lock session killed".into())),
        }
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_lock(&mut self, key: i64) -> Result<bool> {
        let mut inner = self.backend.lock();
        Self::check_alive(&inner, self.session_id)?;
        match inner.locks.get(&key) {
            Some(owner) if *owner == self.session_id => Ok(true),
            Some(_) => Ok(false),
            None => {
                inner.locks.insert(key, self.session_id);
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: i64) -> Result<bool> {
        let mut inner = self.backend.lock();
        Self::check_alive(&inner, self.session_id)?;
        match inner.locks.get(&key) {
            Some(owner) if *owner == self.session_id => {
                inner.locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        let inner = self.backend.lock();
        Self::check_alive(&inner, self.session_id)
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        self.backend.end_session(self.session_id);
    }
}

/// Append-notification source over the backend's broadcast channel.
struct MemoryNotificationSource {
    rx: broadcast::Receiver<AppendNotification>,
    /// Keeps the sending side alive for the lifetime of the source.
    _backend: Arc<MemoryBackend>,
}

#[async_trait]
impl NotificationSource for MemoryNotificationSource {
    async fn recv(&mut self) -> Result<AppendNotification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Ok(notification),
                // A lagged receiver lost notifications; catch-up reads recover.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Connection("notification channel closed".into()));
                }
            }
        }
    }
}
