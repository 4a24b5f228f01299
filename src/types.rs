//! Core domain types for EventwellDB.
//!
//! This module defines the foundational data types that every other module depends on:
//! proposed events (client-submitted), recorded events (server-persisted with positions),
//! expected version semantics for optimistic concurrency, subscription start positions,
//! subscription options, and size limit constants.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Name of the synthetic stream covering every event in global `event_number` order.
///
/// Subscribing to this stream observes all appends across all streams. It cannot be
/// appended to directly.
pub const ALL_STREAM: &str = "$all";

/// Maximum size of a single event record in bytes (payload + metadata + fixed fields).
///
/// Events exceeding this limit are rejected on append. Domain events should be small,
/// structured data (typically JSON). Large artifacts belong in external storage; events
/// carry references to them.
pub const MAX_EVENT_SIZE: usize = 64 * 1024; // 64 KB

/// Maximum length of an event type tag in bytes.
pub const MAX_EVENT_TYPE_LEN: usize = 256;

/// An event the client wants to append to a stream.
///
/// The client assigns the `event_id` (a UUID serving as the durable identity of the
/// event) and provides the event type tag, metadata, and payload as opaque byte
/// buffers. The server does not interpret payload or metadata contents.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Client-assigned unique ID for this event.
    pub event_id: Uuid,
    /// Event type tag (UTF-8, max 256 bytes).
    pub event_type: String,
    /// Opaque infrastructure context (correlation ID, causation ID, etc.).
    pub metadata: Bytes,
    /// Opaque domain event body.
    pub payload: Bytes,
}

/// A persisted event with server-assigned positions.
///
/// After a successful append, the database assigns an `event_number` (monotonic across
/// all streams) and a `stream_version` (contiguous, one-based index within the stream).
/// Both are immutable once assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Client-assigned unique ID.
    pub event_id: Uuid,
    /// Monotonic position across all streams (one-based).
    pub event_number: i64,
    /// Identifier of the stream this event belongs to.
    pub stream_id: String,
    /// Contiguous one-based version within the stream.
    pub stream_version: i64,
    /// Event type tag.
    pub event_type: String,
    /// Opaque metadata bytes.
    pub metadata: Bytes,
    /// Opaque payload bytes.
    pub payload: Bytes,
    /// Server-assigned creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Controls optimistic concurrency on append.
///
/// The caller specifies what state the target stream must be in for the append to
/// succeed. If the check fails, the append is rejected with `WrongExpectedVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No concurrency check -- append succeeds regardless of stream state.
    Any,
    /// Stream must not exist (first write to a new stream).
    NoStream,
    /// Stream must be at exactly this version (one-based; 0 means empty).
    Exact(i64),
}

/// Where a newly created subscription starts reading.
///
/// Only consulted when the durable subscription row is first created; an existing
/// subscription always resumes from its acknowledged checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Start from the first event of the stream.
    Origin,
    /// Start from the current head of the stream; only events appended after the
    /// subscription is created are delivered.
    Current,
    /// Start from this position (one-based; the event at this position is the first
    /// one delivered).
    Exact(i64),
}

/// Predicate applied to each event at enqueue time; events it rejects are never
/// delivered but still advance the subscription checkpoint.
pub type Selector = Arc<dyn Fn(&RecordedEvent) -> bool + Send + Sync>;

/// Derives the partition key used to pin ordering of related events to a single
/// endpoint at a time.
pub type PartitionBy = Arc<dyn Fn(&RecordedEvent) -> String + Send + Sync>;

/// Transforms each event just before delivery to an endpoint.
pub type Mapper = Arc<dyn Fn(RecordedEvent) -> RecordedEvent + Send + Sync>;

/// Default per-endpoint in-flight cap.
pub const DEFAULT_BUFFER_SIZE: usize = 1;

/// Default cap on the number of events buffered in partition queues.
pub const DEFAULT_MAX_SIZE: usize = 1_000;

/// Options accepted when creating a subscription.
///
/// The first `subscribe_to_stream` call for a `(stream, name)` pair configures the
/// subscription; later calls that attach additional endpoints reuse the original
/// configuration.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Start position used when the durable subscription row is first created.
    pub start_from: StartFrom,
    /// Drop events failing this predicate at enqueue time (checkpoint still advances
    /// past them).
    pub selector: Option<Selector>,
    /// Partition events so that equal keys are delivered in order to one endpoint at
    /// a time. When absent, events are distributed round-robin with no affinity.
    pub partition_by: Option<PartitionBy>,
    /// Transform events just before delivery.
    pub mapper: Option<Mapper>,
    /// Per-endpoint in-flight cap (must be >= 1).
    pub buffer_size: usize,
    /// Cap on buffered events across all partition queues (must be >= `buffer_size`).
    /// Crossing it suspends enqueueing until acknowledgements drain the queues.
    pub max_size: usize,
    /// Maximum number of endpoints that may attach concurrently (must be >= 1).
    pub concurrency_limit: usize,
    /// How long to wait before re-attempting leadership acquisition after the
    /// advisory lock was unavailable or lost.
    pub lock_retry_interval: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            start_from: StartFrom::Origin,
            selector: None,
            partition_by: None,
            mapper: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            concurrency_limit: 1,
            lock_retry_interval: Duration::from_secs(1),
        }
    }
}

impl std::fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("start_from", &self.start_from)
            .field("selector", &self.selector.as_ref().map(|_| ".."))
            .field("partition_by", &self.partition_by.as_ref().map(|_| ".."))
            .field("mapper", &self.mapper.as_ref().map(|_| ".."))
            .field("buffer_size", &self.buffer_size)
            .field("max_size", &self.max_size)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("lock_retry_interval", &self.lock_retry_interval)
            .finish()
    }
}
