//! Subscription supervisor and orchestrator.
//!
//! Owns the name registry keyed by `(stream_id, subscription_name)` and the
//! lifecycle of the per-subscription tasks. Subscribing ensures the task exists
//! (recycling one that has terminated) and attaches the endpoint; unsubscribing
//! and deletion stop the task, deletion also removing the durable row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::bus::RegistrationBus;
use crate::error::{Error, Result};
use crate::locks::AdvisoryLocks;
use crate::storage::Storage;
use crate::subscription::{Endpoint, SubscriptionActor, SubscriptionCommand, spawn_subscription};
use crate::types::SubscriptionOptions;

type RegistryKey = (String, String);

/// Registry and lifecycle manager for subscription tasks.
pub(crate) struct Subscriptions {
    storage: Arc<dyn Storage>,
    locks: AdvisoryLocks,
    bus: RegistrationBus,
    registry: Mutex<HashMap<RegistryKey, SubscriptionActor>>,
}

impl Subscriptions {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        locks: AdvisoryLocks,
        bus: RegistrationBus,
    ) -> Self {
        Self {
            storage,
            locks,
            bus,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn validate(stream_id: &str, subscription_name: &str, options: &SubscriptionOptions) -> Result<()> {
        if stream_id.is_empty() {
            return Err(Error::InvalidArgument("stream_id must not be empty".into()));
        }
        if subscription_name.is_empty() {
            return Err(Error::InvalidArgument(
                "subscription_name must not be empty".into(),
            ));
        }
        if options.buffer_size < 1 {
            return Err(Error::InvalidArgument("buffer_size must be >= 1".into()));
        }
        if options.max_size < options.buffer_size {
            return Err(Error::InvalidArgument(
                "max_size must be >= buffer_size".into(),
            ));
        }
        if options.concurrency_limit < 1 {
            return Err(Error::InvalidArgument(
                "concurrency_limit must be >= 1".into(),
            ));
        }
        Ok(())
    }

    /// Ensure the subscription task exists and attach `endpoint` to it.
    ///
    /// The first call for a `(stream, name)` pair configures the subscription
    /// from `options`; later calls attach additional endpoints (subject to the
    /// original `concurrency_limit`) and their options are otherwise ignored.
    ///
    /// # Errors
    ///
    /// [`Error::SubscriptionAlreadyExists`] when the subscription has no room
    /// for another endpoint.
    pub(crate) async fn subscribe(
        &self,
        stream_id: &str,
        subscription_name: &str,
        endpoint: Endpoint,
        options: SubscriptionOptions,
    ) -> Result<()> {
        Self::validate(stream_id, subscription_name, &options)?;
        let key = (stream_id.to_string(), subscription_name.to_string());

        // Two attempts: the task found in the registry may have terminated
        // between lookup and connect (last endpoint just died); recycle once.
        for _ in 0..2 {
            let tx = self.ensure_task(&key, &options);

            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = tx.send(SubscriptionCommand::Connect {
                endpoint: endpoint.clone(),
                reply: reply_tx,
            });
            if sent.is_err() {
                self.forget_task(&key);
                continue;
            }
            match reply_rx.await {
                Ok(outcome) => return outcome,
                Err(_) => {
                    self.forget_task(&key);
                    continue;
                }
            }
        }
        Err(Error::Connection("subscription task unavailable".into()))
    }

    /// Detach every endpoint and stop the subscription task, keeping the
    /// durable checkpoint.
    pub(crate) async fn unsubscribe(&self, stream_id: &str, subscription_name: &str) -> Result<()> {
        let key = (stream_id.to_string(), subscription_name.to_string());
        let Some(actor) = self.remove_task(&key) else {
            return Ok(());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if actor
            .tx
            .send(SubscriptionCommand::Unsubscribe { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
        Ok(())
    }

    /// Stop the subscription task and delete its durable row.
    pub(crate) async fn delete(&self, stream_id: &str, subscription_name: &str) -> Result<()> {
        let key = (stream_id.to_string(), subscription_name.to_string());
        if let Some(actor) = self.remove_task(&key) {
            let (reply_tx, reply_rx) = oneshot::channel();
            if actor
                .tx
                .send(SubscriptionCommand::Stop { reply: reply_tx })
                .is_ok()
            {
                let _ = reply_rx.await;
            }
        }
        self.storage
            .delete_subscription(stream_id, subscription_name)
            .await
    }

    /// Stop every subscription task.
    pub(crate) async fn shutdown(&self) {
        let drained: Vec<SubscriptionActor> = {
            let mut registry = self.lock();
            registry.drain().map(|(_, actor)| actor).collect()
        };
        for actor in drained {
            let (reply_tx, reply_rx) = oneshot::channel();
            if actor
                .tx
                .send(SubscriptionCommand::Stop { reply: reply_tx })
                .is_ok()
            {
                let _ = reply_rx.await;
            }
        }
    }

    /// Number of registered, still-running subscription tasks.
    pub(crate) fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|actor| !actor.is_finished())
            .count()
    }

    fn ensure_task(
        &self,
        key: &RegistryKey,
        options: &SubscriptionOptions,
    ) -> mpsc::UnboundedSender<SubscriptionCommand> {
        let mut registry = self.lock();
        if let Some(actor) = registry.get(key)
            && !actor.is_finished()
        {
            return actor.tx.clone();
        }

        let actor = spawn_subscription(
            Arc::clone(&self.storage),
            self.locks.clone(),
            self.bus.clone(),
            key.0.clone(),
            key.1.clone(),
            options.clone(),
        );
        let tx = actor.tx.clone();
        registry.insert(key.clone(), actor);
        tx
    }

    fn forget_task(&self, key: &RegistryKey) {
        self.lock().remove(key);
    }

    fn remove_task(&self, key: &RegistryKey) -> Option<SubscriptionActor> {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RegistryKey, SubscriptionActor>> {
        self.registry.lock().expect("Subscriptions registry mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::spawn_lock_manager;
    use crate::storage::MemoryStorage;
    use crate::subscription::SubscriptionNotice;
    use crate::types::{ExpectedVersion, ProposedEvent, StartFrom};
    use bytes::Bytes;
    use std::time::Duration;
    use uuid::Uuid;

    const FAST: Duration = Duration::from_millis(20);

    fn subscriptions() -> (Arc<MemoryStorage>, Subscriptions) {
        let storage = Arc::new(MemoryStorage::new());
        let (locks, _join) = spawn_lock_manager(storage.clone(), FAST);
        let subs = Subscriptions::new(storage.clone(), locks, RegistrationBus::new());
        (storage, subs)
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            buffer_size: 10,
            lock_retry_interval: FAST,
            ..Default::default()
        }
    }

    fn proposed() -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: "TestEvt".to_string(),
            metadata: Bytes::new(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn duplicate_subscribe_without_concurrency_is_rejected() {
        let (_storage, subs) = subscriptions();

        let (first, _first_rx) = Endpoint::channel();
        subs.subscribe("orders", "projector", first, options())
            .await
            .expect("first subscribe");

        let (second, _second_rx) = Endpoint::channel();
        let result = subs.subscribe("orders", "projector", second, options()).await;
        assert!(matches!(
            result,
            Err(Error::SubscriptionAlreadyExists { .. })
        ));
        assert_eq!(subs.active_count(), 1);
    }

    #[tokio::test]
    async fn concurrency_limit_admits_up_to_the_count() {
        let (_storage, subs) = subscriptions();
        let opts = SubscriptionOptions {
            concurrency_limit: 2,
            ..options()
        };

        let (e1, _rx1) = Endpoint::channel();
        let (e2, _rx2) = Endpoint::channel();
        let (e3, _rx3) = Endpoint::channel();
        subs.subscribe("orders", "workers", e1, opts.clone())
            .await
            .expect("first endpoint");
        subs.subscribe("orders", "workers", e2, opts.clone())
            .await
            .expect("second endpoint");
        let third = subs.subscribe("orders", "workers", e3, opts).await;
        assert!(matches!(
            third,
            Err(Error::SubscriptionAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn distinct_names_are_independent() {
        let (_storage, subs) = subscriptions();

        let (e1, _rx1) = Endpoint::channel();
        let (e2, _rx2) = Endpoint::channel();
        subs.subscribe("orders", "projector", e1, options())
            .await
            .expect("projector");
        subs.subscribe("orders", "auditor", e2, options())
            .await
            .expect("auditor");
        assert_eq!(subs.active_count(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_frees_the_name() {
        let (_storage, subs) = subscriptions();

        let (e1, _rx1) = Endpoint::channel();
        subs.subscribe("orders", "projector", e1, options())
            .await
            .expect("subscribe");
        subs.unsubscribe("orders", "projector")
            .await
            .expect("unsubscribe");
        assert_eq!(subs.active_count(), 0);

        let (e2, _rx2) = Endpoint::channel();
        subs.subscribe("orders", "projector", e2, options())
            .await
            .expect("re-subscribe after unsubscribe");
    }

    #[tokio::test]
    async fn unsubscribe_keeps_the_durable_checkpoint() {
        let (storage, subs) = subscriptions();
        storage
            .append_events("orders", ExpectedVersion::Any, vec![proposed()])
            .await
            .expect("append");

        let (endpoint, mut rx) = Endpoint::channel();
        subs.subscribe("orders", "projector", endpoint, options())
            .await
            .expect("subscribe");

        // Drive the delivery and ack it so the checkpoint lands at 1.
        let handle = loop {
            match rx.recv().await.expect("notice") {
                SubscriptionNotice::Subscribed(handle) => break handle,
                SubscriptionNotice::Events(_) => {}
            }
        };
        loop {
            if let SubscriptionNotice::Events(events) = rx.recv().await.expect("notice") {
                handle.ack(events.last().expect("non-empty").stream_version)
                    .await
                    .expect("ack");
                break;
            }
        }

        subs.unsubscribe("orders", "projector")
            .await
            .expect("unsubscribe");

        let row = storage
            .subscribe_to_stream("orders", "projector", StartFrom::Origin)
            .await
            .expect("row survives");
        assert_eq!(row.last_seen, 1);
    }

    #[tokio::test]
    async fn delete_removes_the_durable_row() {
        let (storage, subs) = subscriptions();

        let (endpoint, _rx) = Endpoint::channel();
        subs.subscribe("orders", "projector", endpoint, options())
            .await
            .expect("subscribe");
        subs.delete("orders", "projector").await.expect("delete");

        // A fresh subscribe starts from scratch with a new row id.
        let row = storage
            .subscribe_to_stream("orders", "projector", StartFrom::Origin)
            .await
            .expect("new row");
        assert_eq!(row.last_seen, 0);
    }

    #[tokio::test]
    async fn a_terminated_task_is_recycled_on_subscribe() {
        let (_storage, subs) = subscriptions();

        let (endpoint, rx) = Endpoint::channel();
        subs.subscribe("orders", "projector", endpoint, options())
            .await
            .expect("subscribe");

        // Dropping the only consumer terminates the task.
        drop(rx);
        for _ in 0..100 {
            if subs.active_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(subs.active_count(), 0, "task should stop with no endpoints");

        let (fresh, _fresh_rx) = Endpoint::channel();
        subs.subscribe("orders", "projector", fresh, options())
            .await
            .expect("recycled subscribe");
        assert_eq!(subs.active_count(), 1);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected() {
        let (_storage, subs) = subscriptions();

        let (endpoint, _rx) = Endpoint::channel();
        let bad = SubscriptionOptions {
            buffer_size: 8,
            max_size: 4,
            ..Default::default()
        };
        let result = subs.subscribe("orders", "projector", endpoint, bad).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let (endpoint, _rx) = Endpoint::channel();
        let result = subs
            .subscribe("", "projector", endpoint, options())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
