//! EventwellDB: a PostgreSQL-backed event store with durable, partitioned,
//! acknowledgement-driven subscriptions.
//!
//! Producers append ordered events to named streams; consumers attach endpoints
//! to named subscriptions -- per stream or across all streams via `"$all"` --
//! and receive every selector-accepted event exactly once per subscription, in
//! order, with ack-based flow control. The database provides durable storage
//! and the notify channel; this crate layers catch-up, live push, partitioned
//! fan-out across cooperating endpoints, and single-leader coordination via
//! session advisory locks on top.

pub mod bus;
pub mod error;
pub(crate) mod fanout;
pub mod locks;
pub mod metrics;
pub mod notifications;
pub mod service;
pub mod storage;
pub mod subscription;
pub(crate) mod supervisor;
pub mod types;

pub use bus::RegistrationBus;
pub use error::{Error, Result};
pub use locks::{AdvisoryLocks, LockEvent, LockRef};
pub use notifications::{AppendNotification, NOTIFICATION_CHANNEL, NotificationSource};
pub use service::{EventStore, EventStoreConfig};
pub use storage::{
    LockSession, MemoryBackend, MemoryStorage, PostgresStorage, Storage, SubscriptionRow,
};
pub use subscription::{Endpoint, SubscriptionHandle, SubscriptionNotice};
pub use types::{
    ALL_STREAM, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_SIZE, ExpectedVersion, MAX_EVENT_SIZE,
    MAX_EVENT_TYPE_LEN, Mapper, PartitionBy, ProposedEvent, RecordedEvent, Selector, StartFrom,
    SubscriptionOptions,
};
