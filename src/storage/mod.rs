//! Storage gateway: typed operations over the backing database.
//!
//! The [`Storage`] trait is the seam between the subscription engine and durable
//! state. The production implementation is [`postgres::PostgresStorage`];
//! [`memory::MemoryStorage`] implements the same contract in process for tests and
//! embedded use. All other modules depend only on the trait.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::notifications::NotificationSource;
use crate::types::{
    ExpectedVersion, MAX_EVENT_SIZE, MAX_EVENT_TYPE_LEN, ProposedEvent, RecordedEvent, StartFrom,
};

pub use memory::{MemoryBackend, MemoryStorage};
pub use postgres::PostgresStorage;

/// Reject events exceeding the size limits before touching the database.
pub(crate) fn validate_events(events: &[ProposedEvent]) -> Result<()> {
    for event in events {
        if event.event_type.len() > MAX_EVENT_TYPE_LEN {
            return Err(Error::InvalidArgument(format!(
                "event type exceeds {MAX_EVENT_TYPE_LEN} bytes"
            )));
        }
        let size = event.payload.len() + event.metadata.len() + event.event_type.len();
        if size > MAX_EVENT_SIZE {
            return Err(Error::EventTooLarge {
                size,
                max: MAX_EVENT_SIZE,
            });
        }
    }
    Ok(())
}

/// Durable state of a subscription: its advisory-lock key and acknowledged
/// checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRow {
    /// Row id, also used as the advisory-lock key for subscription leadership.
    pub subscription_id: i64,
    /// Highest contiguously acknowledged position (0 when nothing is acknowledged).
    pub last_seen: i64,
}

/// A dedicated database session scoped to advisory locks.
///
/// Advisory locks are session-scoped: they live exactly as long as the connection
/// that took them. The lock manager owns one session per node and routes every
/// acquire/release through it. A transport error from any method means the session
/// (and every lock it held) is gone.
#[async_trait]
pub trait LockSession: Send {
    /// Attempt to take the advisory lock for `key` without blocking.
    ///
    /// Returns `Ok(true)` if the lock was taken, `Ok(false)` if another session
    /// holds it.
    async fn try_lock(&mut self, key: i64) -> Result<bool>;

    /// Release the advisory lock for `key`.
    ///
    /// Returns `Ok(false)` if this session did not hold the lock.
    async fn unlock(&mut self, key: i64) -> Result<bool>;

    /// Liveness probe. An error means the session is lost and all held locks have
    /// been released by the database.
    async fn ping(&mut self) -> Result<()>;
}

/// Typed operations over the backing database.
///
/// Every method acquires its own pooled connection; the two exclusive sessions
/// (advisory locks, notification listening) are created through the factory
/// methods and owned by their single consumer.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Create the schema if it is absent. Idempotent; returns `true` if the schema
    /// was created by this call, `false` if it already existed.
    async fn initialize(&self) -> Result<bool>;

    /// Create an empty stream, returning its internal row id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamExists`](crate::Error::StreamExists) if the stream
    /// already exists.
    async fn create_stream(&self, stream_id: &str) -> Result<i64>;

    /// Append events to a stream transactionally, assigning contiguous
    /// `stream_version`s and monotonic `event_number`s, and emitting an append
    /// notification as a side effect of the commit.
    ///
    /// The stream is created implicitly on first append (unless `expected_version`
    /// is `Exact`, which requires it to exist).
    ///
    /// # Errors
    ///
    /// - [`Error::WrongExpectedVersion`](crate::Error::WrongExpectedVersion) if the
    ///   concurrency check fails.
    /// - [`Error::StreamNotFound`](crate::Error::StreamNotFound) if `Exact` targets
    ///   an absent stream.
    /// - [`Error::EventTooLarge`](crate::Error::EventTooLarge) if any event exceeds
    ///   the size limit.
    async fn append_events(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>>;

    /// Read events forward from a stream starting at `from` (one-based), up to
    /// `max_count` events. The synthetic `$all` stream reads by `event_number`;
    /// named streams read by `stream_version`. An empty result means the caller is
    /// at the head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`](crate::Error::StreamNotFound) for an
    /// absent named stream.
    async fn read_stream_forward(
        &self,
        stream_id: &str,
        from: i64,
        max_count: i64,
    ) -> Result<Vec<RecordedEvent>>;

    /// Find or create the durable subscription row for `(stream_id, name)`.
    ///
    /// Idempotent: a concurrent or prior creation collapses to returning the
    /// existing row. `start_from` is only consulted on first creation.
    async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        subscription_name: &str,
        start_from: StartFrom,
    ) -> Result<SubscriptionRow>;

    /// Persist the acknowledged checkpoint for a subscription. Conditional: the
    /// stored value never decreases, so replays and races are harmless.
    async fn ack_last_seen_event(
        &self,
        stream_id: &str,
        subscription_name: &str,
        last_seen: i64,
    ) -> Result<()>;

    /// Delete the durable subscription row. Deleting an absent row is not an error.
    async fn delete_subscription(&self, stream_id: &str, subscription_name: &str) -> Result<()>;

    /// Open a dedicated session for advisory locks.
    async fn lock_session(&self) -> Result<Box<dyn LockSession>>;

    /// Open a dedicated session receiving append notifications.
    async fn notification_source(&self) -> Result<Box<dyn NotificationSource>>;
}
