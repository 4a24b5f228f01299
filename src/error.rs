//! Error types for EventwellDB.
//!
//! This module defines the unified error enum used throughout the crate. All fallible
//! operations return `Result<T, Error>`. Transport failures from the database are
//! wrapped in [`Error::Storage`] and classified as retryable; every other variant
//! represents a definite outcome that retrying will not change.

use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type for all EventwellDB operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The stream already exists (creation collided with a concurrent or prior create).
    #[error("stream already exists: {stream_id}")]
    StreamExists {
        /// Identifier of the stream that already exists.
        stream_id: String,
    },

    /// The requested stream does not exist.
    #[error("stream not found: {stream_id}")]
    StreamNotFound {
        /// Identifier of the stream that was not found.
        stream_id: String,
    },

    /// Optimistic concurrency check failed: the stream's current version does not
    /// match the caller's expectation.
    #[error("wrong expected version for {stream_id}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        /// Identifier of the stream the append targeted.
        stream_id: String,
        /// The version the caller expected the stream to be at.
        expected: String,
        /// The version the stream is actually at.
        actual: String,
    },

    /// A subscription with this name already exists on the stream, or its endpoint
    /// capacity is exhausted.
    #[error("subscription already exists: {subscription_name} on {stream_id}")]
    SubscriptionAlreadyExists {
        /// Identifier of the stream the subscription targets.
        stream_id: String,
        /// Name of the conflicting subscription.
        subscription_name: String,
    },

    /// An acknowledgement arrived from an endpoint that is not attached to the
    /// subscription.
    #[error("unknown subscriber: {endpoint_id}")]
    UnknownSubscriber {
        /// Identifier of the unrecognized endpoint.
        endpoint_id: Uuid,
    },

    /// An acknowledgement referenced a position the endpoint has no in-flight
    /// event at or below.
    #[error("invalid ack: no in-flight event at or below {seq}")]
    InvalidAck {
        /// The acknowledged position.
        seq: i64,
    },

    /// The advisory lock is held elsewhere.
    #[error("advisory lock already taken: {key}")]
    LockAlreadyTaken {
        /// Integer key of the contended lock.
        key: i64,
    },

    /// The operation requires subscription leadership this node does not hold.
    #[error("not the leader for this subscription")]
    NotLeader,

    /// An append notification payload could not be parsed.
    #[error("invalid notification payload: {0}")]
    InvalidNotification(String),

    /// The event exceeds the maximum allowed size.
    #[error("event too large: {size} bytes exceeds {max} byte limit")]
    EventTooLarge {
        /// Actual size of the event in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },

    /// A request argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A database transport or query error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A connection-level failure on a dedicated session (lock session or
    /// notification listener).
    #[error("connection lost: {0}")]
    Connection(String),
}

impl Error {
    /// Whether the failed operation may succeed if retried.
    ///
    /// Only transport-level failures are retryable; every other variant is a
    /// definite outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Connection(_))
    }
}
