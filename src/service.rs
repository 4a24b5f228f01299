//! Service facade for EventwellDB.
//!
//! [`EventStore`] wires the collaborators together -- storage gateway,
//! registration bus, advisory-lock manager, notification pipeline, and the
//! subscription supervisor -- and exposes the public operations: append/read
//! passthrough and the subscription API.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::RegistrationBus;
use crate::error::Result;
use crate::locks::{AdvisoryLocks, spawn_lock_manager};
use crate::notifications::{NotificationPipeline, spawn_pipeline};
use crate::storage::{PostgresStorage, Storage};
use crate::subscription::Endpoint;
use crate::supervisor::Subscriptions;
use crate::types::{ExpectedVersion, ProposedEvent, RecordedEvent, SubscriptionOptions};

/// Tunables for a service instance.
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// How often the lock manager probes its dedicated session for liveness.
    /// Bounds how long a dead session can go unnoticed while idle.
    pub lock_ping_interval: Duration,
    /// How often this node stands for notification-pipeline leadership while
    /// another node holds it.
    pub pipeline_retry_interval: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            lock_ping_interval: Duration::from_secs(15),
            pipeline_retry_interval: Duration::from_secs(1),
        }
    }
}

/// One service node: the subscription engine layered over a storage gateway.
///
/// Dropping the store without calling [`shutdown`](Self::shutdown) abandons the
/// background tasks to the runtime; prefer an explicit shutdown.
pub struct EventStore {
    storage: Arc<dyn Storage>,
    subscriptions: Subscriptions,
    pipeline: Option<NotificationPipeline>,
    locks: AdvisoryLocks,
    locks_join: tokio::task::JoinHandle<()>,
}

impl EventStore {
    /// Connect to PostgreSQL and start the node with default tuning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the pool cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self> {
        let storage = PostgresStorage::connect(url).await?;
        Ok(Self::with_storage(Arc::new(storage)))
    }

    /// Start the node over any storage gateway with default tuning.
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, EventStoreConfig::default())
    }

    /// Start the node over any storage gateway.
    pub fn with_config(storage: Arc<dyn Storage>, config: EventStoreConfig) -> Self {
        let bus = RegistrationBus::new();
        let (locks, locks_join) =
            spawn_lock_manager(Arc::clone(&storage), config.lock_ping_interval);
        let pipeline = spawn_pipeline(
            Arc::clone(&storage),
            bus.clone(),
            locks.clone(),
            config.pipeline_retry_interval,
        );
        let subscriptions = Subscriptions::new(Arc::clone(&storage), locks.clone(), bus);

        Self {
            storage,
            subscriptions,
            pipeline: Some(pipeline),
            locks,
            locks_join,
        }
    }

    /// The storage gateway this node runs over.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// Create an empty stream.
    ///
    /// # Errors
    ///
    /// [`Error::StreamExists`](crate::Error::StreamExists) if it already exists.
    pub async fn create_stream(&self, stream_id: &str) -> Result<i64> {
        self.storage.create_stream(stream_id).await
    }

    /// Append events to a stream with optimistic concurrency. The stream is
    /// created on first append.
    pub async fn append_to_stream(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<Vec<RecordedEvent>> {
        let recorded = self
            .storage
            .append_events(stream_id, expected_version, events)
            .await?;
        metrics::counter!("eventwell_events_appended_total").increment(recorded.len() as u64);
        Ok(recorded)
    }

    /// Read events forward from a stream (or `"$all"`) starting at `from`
    /// (one-based).
    pub async fn read_stream_forward(
        &self,
        stream_id: &str,
        from: i64,
        max_count: i64,
    ) -> Result<Vec<RecordedEvent>> {
        self.storage
            .read_stream_forward(stream_id, from, max_count)
            .await
    }

    /// Attach `endpoint` to the named subscription on `stream_id` (or `"$all"`),
    /// creating the durable subscription if needed.
    ///
    /// The endpoint receives [`SubscriptionNotice::Subscribed`](crate::SubscriptionNotice)
    /// once this node leads the subscription, followed by `Events` batches; it
    /// acknowledges through the delivered handle.
    ///
    /// # Errors
    ///
    /// [`Error::SubscriptionAlreadyExists`](crate::Error::SubscriptionAlreadyExists)
    /// when the subscription has no room for another endpoint (the default
    /// `concurrency_limit` of 1 admits a single endpoint).
    pub async fn subscribe_to_stream(
        &self,
        stream_id: &str,
        subscription_name: &str,
        endpoint: Endpoint,
        options: SubscriptionOptions,
    ) -> Result<()> {
        self.subscriptions
            .subscribe(stream_id, subscription_name, endpoint, options)
            .await
    }

    /// Detach every endpoint of the named subscription and stop its task. The
    /// durable checkpoint survives for a later re-subscribe.
    pub async fn unsubscribe_from_stream(
        &self,
        stream_id: &str,
        subscription_name: &str,
    ) -> Result<()> {
        self.subscriptions
            .unsubscribe(stream_id, subscription_name)
            .await
    }

    /// Stop the named subscription and delete its durable row.
    pub async fn delete_subscription(
        &self,
        stream_id: &str,
        subscription_name: &str,
    ) -> Result<()> {
        self.subscriptions.delete(stream_id, subscription_name).await
    }

    /// Number of running subscription tasks on this node.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.active_count()
    }

    /// Stop the pipeline, every subscription task, and the lock manager, in
    /// that order.
    pub async fn shutdown(self) {
        let EventStore {
            storage: _storage,
            subscriptions,
            pipeline,
            locks,
            locks_join,
        } = self;

        if let Some(pipeline) = pipeline {
            pipeline.shutdown().await;
        }
        subscriptions.shutdown().await;

        // The manager exits once every handle is gone (subscription tasks drop
        // theirs as they stop).
        drop(subscriptions);
        drop(locks);
        let _ = locks_join.await;
    }
}
