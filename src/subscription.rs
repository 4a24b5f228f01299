//! Per-subscription state machine.
//!
//! Each subscription runs as one task owning all of its state; commands arrive on
//! an unbounded mailbox and are processed to completion one at a time. The machine
//! moves through a closed set of phases:
//!
//! ```text
//! initial -> request_catch_up -> catching_up -> subscribed <-> max_capacity
//!    ^                                              |
//!    +----------------- disconnected <--------------+   (advisory lock lost)
//! ```
//!
//! plus the terminal `unsubscribed` once the last endpoint detaches. Leadership is
//! a cluster-wide advisory lock keyed by the durable subscription id: only the
//! holder consumes events and persists acknowledgements; non-holders park in
//! `initial` and retry on a timer.

use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{EventBatch, RegistrationBus};
use crate::error::{Error, Result};
use crate::fanout::{Sequenced, SubscriberSet};
use crate::locks::{AdvisoryLocks, LockEvent, LockRef};
use crate::storage::Storage;
use crate::types::{ALL_STREAM, RecordedEvent, SubscriptionOptions};

/// One consumer attached to a subscription.
///
/// The endpoint is the sending half of an unbounded channel of
/// [`SubscriptionNotice`] values; the consumer drives the receiving half.
/// Dropping the receiver is how an endpoint "dies": the subscription detects the
/// closure, re-queues the endpoint's in-flight events, and removes it.
#[derive(Clone)]
pub struct Endpoint {
    id: Uuid,
    tx: mpsc::UnboundedSender<SubscriptionNotice>,
}

impl Endpoint {
    /// Create an endpoint and the receiver its consumer reads notices from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriptionNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// Unique identifier of this endpoint.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver a notice; returns `false` if the consumer is gone.
    pub(crate) fn send(&self, notice: SubscriptionNotice) -> bool {
        self.tx.send(notice).is_ok()
    }

    /// Resolves once the consumer drops its receiver.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id).finish()
    }
}

/// Messages a subscription delivers to its endpoints.
#[derive(Debug)]
pub enum SubscriptionNotice {
    /// The subscription acquired leadership and this endpoint is attached; the
    /// handle is used to acknowledge deliveries.
    Subscribed(SubscriptionHandle),
    /// A batch of events, in delivery order.
    Events(Vec<RecordedEvent>),
}

/// Per-endpoint handle for acknowledging deliveries.
#[derive(Clone)]
pub struct SubscriptionHandle {
    endpoint_id: Uuid,
    tx: mpsc::UnboundedSender<SubscriptionCommand>,
}

impl SubscriptionHandle {
    /// The endpoint this handle acknowledges for.
    pub fn endpoint_id(&self) -> Uuid {
        self.endpoint_id
    }

    /// Acknowledge every delivered event at or below `seq`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSubscriber`] if the endpoint is no longer attached.
    /// - [`Error::InvalidAck`] if `seq` names a position above everything in
    ///   flight to this endpoint.
    /// - [`Error::NotLeader`] if the subscription lost leadership since the
    ///   delivery; the events will be redelivered.
    /// - [`Error::Connection`] if the subscription has shut down.
    pub async fn ack(&self, seq: i64) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SubscriptionCommand::Ack {
                endpoint_id: self.endpoint_id,
                seq,
                reply: reply_tx,
            })
            .map_err(|_| Error::Connection("subscription stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Connection("subscription stopped".into()))?
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("endpoint_id", &self.endpoint_id)
            .finish()
    }
}

/// Commands processed by the subscription task.
pub(crate) enum SubscriptionCommand {
    /// (Re-)attempt the durable-row lookup and leadership acquisition.
    Subscribe,
    /// Read the next batch from storage.
    CatchUp,
    /// A batch pushed by the notification pipeline.
    NotifyEvents(EventBatch),
    Ack {
        endpoint_id: Uuid,
        seq: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        endpoint: Endpoint,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Detach every endpoint and stop.
    Unsubscribe {
        reply: oneshot::Sender<()>,
    },
    EndpointDown(Uuid),
    LockLost(LockRef),
    /// Stop without touching the durable row (deletion handles that).
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    RequestCatchUp,
    CatchingUp,
    Subscribed,
    MaxCapacity,
    Disconnected,
    Unsubscribed,
}

/// Handle to a running subscription task.
pub(crate) struct SubscriptionActor {
    pub(crate) tx: mpsc::UnboundedSender<SubscriptionCommand>,
    pub(crate) join: JoinHandle<()>,
}

impl SubscriptionActor {
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn the subscription task for `(stream_id, subscription_name)`.
///
/// The task immediately begins the acquisition sequence; endpoints attach via
/// [`SubscriptionCommand::Connect`].
pub(crate) fn spawn_subscription(
    storage: Arc<dyn Storage>,
    locks: AdvisoryLocks,
    bus: RegistrationBus,
    stream_id: String,
    subscription_name: String,
    options: SubscriptionOptions,
) -> SubscriptionActor {
    let (tx, rx) = mpsc::unbounded_channel();

    // Lock-loss events are forwarded into the mailbox so they serialize with
    // everything else.
    let (lock_events_tx, mut lock_events_rx) = mpsc::unbounded_channel();
    let forward_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(LockEvent::Lost(lock_ref)) = lock_events_rx.recv().await {
            if forward_tx
                .send(SubscriptionCommand::LockLost(lock_ref))
                .is_err()
            {
                break;
            }
        }
    });

    let last_sent = 0;
    let state = SubscriptionState {
        storage,
        locks,
        bus,
        stream_id,
        subscription_name,
        options,
        phase: Phase::Initial,
        lock_ref: None,
        last_received: 0,
        last_ack: 0,
        set: SubscriberSet::new(last_sent),
        bus_attached: false,
        retry_pending: false,
        self_tx: tx.clone(),
        lock_events_tx,
    };

    let _ = tx.send(SubscriptionCommand::Subscribe);
    let join = tokio::spawn(run_subscription(state, rx));
    SubscriptionActor { tx, join }
}

async fn run_subscription(
    mut state: SubscriptionState,
    mut rx: mpsc::UnboundedReceiver<SubscriptionCommand>,
) {
    while let Some(command) = rx.recv().await {
        if !state.handle(command).await {
            break;
        }
    }
    state.teardown();
}

struct SubscriptionState {
    storage: Arc<dyn Storage>,
    locks: AdvisoryLocks,
    bus: RegistrationBus,
    stream_id: String,
    subscription_name: String,
    options: SubscriptionOptions,
    phase: Phase,
    /// Held iff this node leads the subscription.
    lock_ref: Option<LockRef>,
    /// Horizon of positions known to exist (from notifications or reads).
    last_received: i64,
    /// Durable watermark: highest contiguously acknowledged position.
    last_ack: i64,
    set: SubscriberSet,
    bus_attached: bool,
    retry_pending: bool,
    self_tx: mpsc::UnboundedSender<SubscriptionCommand>,
    lock_events_tx: mpsc::UnboundedSender<LockEvent>,
}

impl SubscriptionState {
    /// Process one command; returns `false` when the task should stop.
    async fn handle(&mut self, command: SubscriptionCommand) -> bool {
        match command {
            SubscriptionCommand::Subscribe => {
                self.retry_pending = false;
                self.on_subscribe().await;
                true
            }
            SubscriptionCommand::CatchUp => {
                self.on_catch_up().await;
                true
            }
            SubscriptionCommand::NotifyEvents(batch) => {
                self.on_notify(&batch).await;
                true
            }
            SubscriptionCommand::Ack {
                endpoint_id,
                seq,
                reply,
            } => {
                let outcome = self.on_ack(endpoint_id, seq).await;
                let _ = reply.send(outcome);
                true
            }
            SubscriptionCommand::Connect { endpoint, reply } => {
                let outcome = self.on_connect(endpoint).await;
                let _ = reply.send(outcome);
                true
            }
            SubscriptionCommand::EndpointDown(endpoint_id) => self.on_endpoint_down(endpoint_id).await,
            SubscriptionCommand::LockLost(lock_ref) => {
                self.on_lock_lost(lock_ref);
                true
            }
            SubscriptionCommand::Unsubscribe { reply } => {
                self.phase = Phase::Unsubscribed;
                let _ = reply.send(());
                false
            }
            SubscriptionCommand::Stop { reply } => {
                self.phase = Phase::Unsubscribed;
                let _ = reply.send(());
                false
            }
        }
    }

    /// Position of an event in this subscription's ordering.
    fn sequence_of(&self, event: &RecordedEvent) -> i64 {
        if self.stream_id == ALL_STREAM {
            event.event_number
        } else {
            event.stream_version
        }
    }

    fn sequence_batch(&self, events: &[RecordedEvent]) -> Vec<Sequenced> {
        events
            .iter()
            .map(|event| Sequenced {
                seq: self.sequence_of(event),
                event: event.clone(),
            })
            .collect()
    }

    /// The `initial` (and `disconnected` re-entry) acquisition sequence: ensure
    /// the durable row, take the advisory lock, and start catching up.
    async fn on_subscribe(&mut self) {
        if !matches!(self.phase, Phase::Initial | Phase::Disconnected) {
            return;
        }

        let row = match self
            .storage
            .subscribe_to_stream(&self.stream_id, &self.subscription_name, self.options.start_from)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    subscription_name = %self.subscription_name,
                    error = %e,
                    "subscription row lookup failed"
                );
                self.schedule_retry();
                return;
            }
        };

        match self
            .locks
            .try_acquire(row.subscription_id, self.lock_events_tx.clone())
            .await
        {
            Ok(lock_ref) => {
                self.lock_ref = Some(lock_ref);
                // The durable checkpoint is authoritative: another leader may
                // have advanced it while this node was parked.
                self.last_ack = row.last_seen;
                self.set.set_last_sent(row.last_seen);
                self.last_received = self.last_received.max(row.last_seen);
                self.attach_bus();

                tracing::info!(
                    stream_id = %self.stream_id,
                    subscription_name = %self.subscription_name,
                    subscription_id = row.subscription_id,
                    last_seen = row.last_seen,
                    "subscription leading"
                );

                for endpoint_id in self.set.endpoint_ids() {
                    self.notify_subscribed(endpoint_id);
                }
                self.enter_request_catch_up();
            }
            Err(e) => {
                if !matches!(e, Error::LockAlreadyTaken { .. }) {
                    tracing::debug!(error = %e, "leadership acquisition failed");
                }
                self.schedule_retry();
            }
        }
    }

    /// Subscribe to this stream's topic on the registration bus, once.
    fn attach_bus(&mut self) {
        if self.bus_attached {
            return;
        }
        self.bus_attached = true;
        let mut bus_rx = self.bus.subscribe(&self.stream_id);
        let mailbox = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(batch) = bus_rx.recv().await {
                if mailbox
                    .send(SubscriptionCommand::NotifyEvents(batch))
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn notify_subscribed(&self, endpoint_id: Uuid) {
        let Some(endpoint) = self.set.endpoint(endpoint_id) else {
            return;
        };
        let handle = SubscriptionHandle {
            endpoint_id,
            tx: self.self_tx.clone(),
        };
        endpoint.send(SubscriptionNotice::Subscribed(handle));
    }

    fn schedule_retry(&mut self) {
        if self.retry_pending {
            return;
        }
        self.retry_pending = true;
        let mailbox = self.self_tx.clone();
        let delay = self.options.lock_retry_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(SubscriptionCommand::Subscribe);
        });
    }

    /// Enter `request_catch_up` and queue the read.
    fn enter_request_catch_up(&mut self) {
        self.phase = Phase::RequestCatchUp;
        let _ = self.self_tx.send(SubscriptionCommand::CatchUp);
    }

    async fn on_catch_up(&mut self) {
        match self.phase {
            Phase::RequestCatchUp | Phase::CatchingUp => self.catch_up_from_stream().await,
            Phase::Subscribed => self.enter_request_catch_up(),
            _ => {}
        }
    }

    /// Read up to `max_size` events past `last_sent` and feed them through the
    /// fan-out. Transitions per the result:
    ///
    /// - nothing to read and the horizon is reached: `subscribed`;
    /// - nothing to read but the horizon is ahead: stay in `request_catch_up`
    ///   (the next acknowledgement re-triggers the read);
    /// - events read and fully fanned out: re-enter `request_catch_up`;
    /// - events read with a backlog left: `catching_up`.
    async fn catch_up_from_stream(&mut self) {
        let from = self.set.last_sent() + 1;
        let max = self.options.max_size as i64;
        counter!("eventwell_catchup_reads_total").increment(1);

        match self
            .storage
            .read_stream_forward(&self.stream_id, from, max)
            .await
        {
            Err(Error::StreamNotFound { .. }) => {
                // Nothing appended yet; live notifications will wake us.
                self.phase = Phase::Subscribed;
            }
            Err(e) => {
                // Keep state; the next acknowledgement or notification retries.
                tracing::warn!(
                    stream_id = %self.stream_id,
                    error = %e,
                    "catch-up read failed"
                );
            }
            Ok(events) if events.is_empty() => {
                if self.set.last_sent() == self.last_received {
                    self.phase = Phase::Subscribed;
                } else {
                    self.phase = Phase::RequestCatchUp;
                }
            }
            Ok(events) => {
                let batch = self.sequence_batch(&events);
                if let Some(last) = batch.last() {
                    self.last_received = self.last_received.max(last.seq);
                }
                self.enqueue_and_fan_out(batch).await;
                if self.set.queue_size() == 0 {
                    self.enter_request_catch_up();
                } else {
                    self.phase = Phase::CatchingUp;
                }
            }
        }
    }

    async fn on_notify(&mut self, batch: &EventBatch) {
        let sequenced = self.sequence_batch(batch);
        let (Some(first), Some(last)) = (sequenced.first(), sequenced.last()) else {
            return;
        };
        let (first_seq, last_seq) = (first.seq, last.seq);

        if self.phase != Phase::Subscribed {
            // Track the horizon so a later catch-up knows how far behind it is.
            if self.phase != Phase::Unsubscribed {
                self.last_received = self.last_received.max(last_seq);
            }
            return;
        }

        if first_seq < self.last_received + 1 {
            // Already seen (e.g. delivered during catch-up).
            return;
        }
        if first_seq > self.last_received + 1 {
            // Gap: a notification was missed; re-read from storage.
            self.last_received = self.last_received.max(last_seq);
            self.enter_request_catch_up();
            return;
        }

        self.last_received = last_seq;
        self.enqueue_and_fan_out(sequenced).await;
        if self.set.queue_size() >= self.options.max_size {
            tracing::debug!(
                stream_id = %self.stream_id,
                subscription_name = %self.subscription_name,
                queue_size = self.set.queue_size(),
                "subscription at capacity"
            );
            self.phase = Phase::MaxCapacity;
        }
    }

    async fn enqueue_and_fan_out(&mut self, batch: Vec<Sequenced>) {
        self.set.enqueue(
            batch,
            self.options.selector.as_ref(),
            self.options.partition_by.as_ref(),
        );
        self.fan_out_and_deliver().await;
    }

    /// Run one fan-out round, persist any checkpoint advance, then transmit one
    /// batched delivery per endpoint.
    async fn fan_out_and_deliver(&mut self) {
        let deliveries = self.set.fan_out();
        self.persist_checkpoint().await;

        for (endpoint_id, events) in deliveries {
            let events: Vec<RecordedEvent> = match &self.options.mapper {
                Some(mapper) => events.into_iter().map(|event| mapper(event)).collect(),
                None => events,
            };
            counter!("eventwell_events_delivered_total").increment(events.len() as u64);
            if let Some(endpoint) = self.set.endpoint(endpoint_id)
                && !endpoint.send(SubscriptionNotice::Events(events))
            {
                // The liveness watcher will deliver EndpointDown shortly.
                tracing::debug!(endpoint_id = %endpoint_id, "delivery to closed endpoint");
            }
        }
    }

    /// Advance the contiguous watermark and, as leader, persist it.
    async fn persist_checkpoint(&mut self) {
        let advanced = self.set.checkpoint(self.last_ack);
        if advanced == self.last_ack {
            return;
        }
        self.last_ack = advanced;
        if self.lock_ref.is_none() {
            return;
        }
        if let Err(e) = self
            .storage
            .ack_last_seen_event(&self.stream_id, &self.subscription_name, advanced)
            .await
        {
            // The durable row lags until the next advance; the conditional
            // update makes the retry safe.
            tracing::warn!(
                stream_id = %self.stream_id,
                subscription_name = %self.subscription_name,
                error = %e,
                "checkpoint persistence failed"
            );
        }
    }

    async fn on_ack(&mut self, endpoint_id: Uuid, seq: i64) -> Result<()> {
        if matches!(
            self.phase,
            Phase::Initial | Phase::Disconnected | Phase::Unsubscribed
        ) {
            // An ack for a delivery predating leadership loss. The event will
            // be redelivered once leadership returns.
            tracing::debug!(endpoint_id = %endpoint_id, seq, "ack received without leadership");
            return Err(Error::NotLeader);
        }

        self.set.ack(endpoint_id, seq, self.last_ack)?;
        counter!("eventwell_acks_total").increment(1);

        // Freed windows pull queued events forward before any further reads.
        self.fan_out_and_deliver().await;

        match self.phase {
            Phase::RequestCatchUp | Phase::CatchingUp => self.catch_up_from_stream().await,
            Phase::Subscribed => {
                // Probe storage past the horizon so missed notifications cannot
                // strand appended events.
                self.enter_request_catch_up();
            }
            Phase::MaxCapacity => {
                if self.set.queue_size() == 0 {
                    self.enter_request_catch_up();
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn on_connect(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.set.len() >= self.options.concurrency_limit {
            return Err(Error::SubscriptionAlreadyExists {
                stream_id: self.stream_id.clone(),
                subscription_name: self.subscription_name.clone(),
            });
        }
        let endpoint_id = endpoint.id();
        if !self.set.insert_subscriber(endpoint.clone(), self.options.buffer_size) {
            return Err(Error::InvalidArgument(format!(
                "endpoint {endpoint_id} already connected"
            )));
        }
        gauge!("eventwell_subscription_endpoints").increment(1.0);

        // Death watcher: closure of the consumer side becomes a command.
        let mailbox = self.self_tx.clone();
        let watched = endpoint;
        tokio::spawn(async move {
            watched.closed().await;
            let _ = mailbox.send(SubscriptionCommand::EndpointDown(watched.id()));
        });

        if !matches!(
            self.phase,
            Phase::Initial | Phase::Disconnected | Phase::Unsubscribed
        ) {
            self.notify_subscribed(endpoint_id);
            // A fresh window may be able to take queued events immediately.
            self.fan_out_and_deliver().await;
        }
        Ok(())
    }

    async fn on_endpoint_down(&mut self, endpoint_id: Uuid) -> bool {
        if !self.set.remove_subscriber(endpoint_id) {
            return true;
        }
        gauge!("eventwell_subscription_endpoints").decrement(1.0);
        tracing::debug!(
            stream_id = %self.stream_id,
            subscription_name = %self.subscription_name,
            endpoint_id = %endpoint_id,
            "endpoint detached"
        );

        if self.set.is_empty() {
            self.phase = Phase::Unsubscribed;
            return false;
        }

        // Its in-flight events were re-queued; hand them to the survivors.
        self.fan_out_and_deliver().await;
        true
    }

    /// Leadership loss: purge volatile delivery state, keep the durable
    /// checkpoint and the horizon, and retry acquisition.
    fn on_lock_lost(&mut self, lock_ref: LockRef) {
        if self.lock_ref != Some(lock_ref) {
            return;
        }
        tracing::warn!(
            stream_id = %self.stream_id,
            subscription_name = %self.subscription_name,
            "subscription leadership lost"
        );
        self.lock_ref = None;
        self.set.purge();
        // Redeliver everything unacknowledged once leadership returns.
        self.set.set_last_sent(self.last_ack);
        self.phase = Phase::Disconnected;
        self.schedule_retry();
    }

    fn teardown(&mut self) {
        if let Some(lock_ref) = self.lock_ref.take() {
            self.locks.release(lock_ref);
        }
        let endpoints = self.set.len();
        if endpoints > 0 {
            gauge!("eventwell_subscription_endpoints").decrement(endpoints as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::spawn_lock_manager;
    use crate::storage::{MemoryStorage, Storage};
    use crate::types::{ExpectedVersion, ProposedEvent, StartFrom};
    use bytes::Bytes;
    use std::time::Duration;

    const FAST: Duration = Duration::from_millis(20);

    struct Fixture {
        storage: Arc<MemoryStorage>,
        locks: AdvisoryLocks,
        bus: RegistrationBus,
        _locks_join: JoinHandle<()>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let (locks, join) = spawn_lock_manager(storage.clone(), FAST);
        Fixture {
            storage,
            locks,
            bus: RegistrationBus::new(),
            _locks_join: join,
        }
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            buffer_size: 10,
            lock_retry_interval: FAST,
            ..Default::default()
        }
    }

    fn proposed(event_type: &str) -> ProposedEvent {
        ProposedEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            metadata: Bytes::new(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    async fn connect(
        actor: &SubscriptionActor,
        endpoint: Endpoint,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        actor
            .tx
            .send(SubscriptionCommand::Connect {
                endpoint,
                reply: reply_tx,
            })
            .expect("actor alive");
        reply_rx.await.expect("reply")
    }

    async fn expect_subscribed(
        rx: &mut mpsc::UnboundedReceiver<SubscriptionNotice>,
    ) -> SubscriptionHandle {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("should receive a notice")
                .expect("channel open");
            if let SubscriptionNotice::Subscribed(handle) = notice {
                return handle;
            }
        }
    }

    async fn expect_events(
        rx: &mut mpsc::UnboundedReceiver<SubscriptionNotice>,
    ) -> Vec<RecordedEvent> {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("should receive a notice")
                .expect("channel open");
            if let SubscriptionNotice::Events(events) = notice {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn delivers_history_and_persists_checkpoint_on_ack() {
        let f = fixture();
        for i in 0..5 {
            f.storage
                .append_events("orders", ExpectedVersion::Any, vec![proposed(&format!("E{i}"))])
                .await
                .expect("append");
        }

        let actor = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );

        let (endpoint, mut rx) = Endpoint::channel();
        connect(&actor, endpoint).await.expect("connect");

        let handle = expect_subscribed(&mut rx).await;
        let events = expect_events(&mut rx).await;
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].stream_version, 1);
        assert_eq!(events[4].stream_version, 5);

        handle.ack(5).await.expect("ack");

        // The durable row reflects the contiguous watermark.
        let row = f
            .storage
            .subscribe_to_stream("orders", "projector", StartFrom::Origin)
            .await
            .expect("row");
        assert_eq!(row.last_seen, 5);
    }

    #[tokio::test]
    async fn ack_probe_recovers_events_missing_their_notification() {
        let f = fixture();
        f.storage
            .append_events("orders", ExpectedVersion::Any, vec![proposed("E1")])
            .await
            .expect("append");

        let actor = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );
        let (endpoint, mut rx) = Endpoint::channel();
        connect(&actor, endpoint).await.expect("connect");
        let handle = expect_subscribed(&mut rx).await;
        let events = expect_events(&mut rx).await;
        assert_eq!(events.len(), 1);

        // Appends whose notifications never reach the bus (no pipeline runs in
        // this test): the ack-driven probe must find them in storage.
        f.storage
            .append_events(
                "orders",
                ExpectedVersion::Any,
                vec![proposed("E2"), proposed("E3")],
            )
            .await
            .expect("append");

        handle.ack(1).await.expect("ack");
        let recovered = expect_events(&mut rx).await;
        let versions: Vec<i64> = recovered.iter().map(|e| e.stream_version).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn second_node_stays_parked_until_lock_is_free() {
        let f = fixture();
        f.storage
            .append_events("orders", ExpectedVersion::Any, vec![proposed("E1")])
            .await
            .expect("append");

        let leader = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );
        let (leader_endpoint, mut leader_rx) = Endpoint::channel();
        connect(&leader, leader_endpoint).await.expect("connect");
        expect_subscribed(&mut leader_rx).await;

        // A second actor (same durable subscription) on another lock manager
        // cannot acquire leadership while the first holds it.
        let storage_two = Arc::new(MemoryStorage::with_backend(f.storage.backend()));
        let (locks_two, _join_two) = spawn_lock_manager(storage_two.clone(), FAST);
        let standby = spawn_subscription(
            storage_two,
            locks_two,
            RegistrationBus::new(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );
        let (standby_endpoint, mut standby_rx) = Endpoint::channel();
        connect(&standby, standby_endpoint).await.expect("connect");

        let parked =
            tokio::time::timeout(Duration::from_millis(200), standby_rx.recv()).await;
        assert!(parked.is_err(), "standby must not be notified subscribed");

        // Stop the leader; the standby's retry timer wins the lock.
        let (stop_tx, stop_rx) = oneshot::channel();
        leader
            .tx
            .send(SubscriptionCommand::Stop { reply: stop_tx })
            .expect("leader alive");
        stop_rx.await.expect("stopped");

        expect_subscribed(&mut standby_rx).await;
        let events = expect_events(&mut standby_rx).await;
        assert_eq!(events[0].stream_version, 1);
    }

    #[tokio::test]
    async fn invalid_ack_is_reported_and_state_survives() {
        let f = fixture();
        f.storage
            .append_events("orders", ExpectedVersion::Any, vec![proposed("E1")])
            .await
            .expect("append");

        let actor = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );
        let (endpoint, mut rx) = Endpoint::channel();
        connect(&actor, endpoint).await.expect("connect");
        let handle = expect_subscribed(&mut rx).await;
        let events = expect_events(&mut rx).await;
        assert_eq!(events.len(), 1);

        handle.ack(1).await.expect("valid ack");

        // Nothing is in flight now, so a position above the watermark is an
        // error while a replayed position is silently ignored.
        let result = handle.ack(99).await;
        assert!(matches!(result, Err(Error::InvalidAck { seq: 99 })));
        handle.ack(1).await.expect("replayed ack is ignored");
    }

    #[tokio::test]
    async fn connect_beyond_concurrency_limit_is_rejected() {
        let f = fixture();
        let actor = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            SubscriptionOptions {
                concurrency_limit: 2,
                lock_retry_interval: FAST,
                ..Default::default()
            },
        );

        let (e1, _rx1) = Endpoint::channel();
        let (e2, _rx2) = Endpoint::channel();
        let (e3, _rx3) = Endpoint::channel();
        connect(&actor, e1).await.expect("first connect");
        connect(&actor, e2).await.expect("second connect");
        let third = connect(&actor, e3).await;
        assert!(matches!(
            third,
            Err(Error::SubscriptionAlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn live_batches_from_the_bus_are_delivered_in_order() {
        let f = fixture();
        let actor = spawn_subscription(
            f.storage.clone(),
            f.locks.clone(),
            f.bus.clone(),
            "orders".to_string(),
            "projector".to_string(),
            options(),
        );
        let (endpoint, mut rx) = Endpoint::channel();
        connect(&actor, endpoint).await.expect("connect");
        expect_subscribed(&mut rx).await;

        // Simulate the pipeline: append, then publish the recorded batch.
        let recorded = f
            .storage
            .append_events(
                "orders",
                ExpectedVersion::Any,
                vec![proposed("E1"), proposed("E2")],
            )
            .await
            .expect("append");
        // Wait until the subscription is live on the bus topic.
        for _ in 0..50 {
            if f.bus.subscriber_count("orders") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f.bus.publish("orders", Arc::new(recorded));

        let events = expect_events(&mut rx).await;
        let versions: Vec<i64> = events.iter().map(|e| e.stream_version).collect();
        assert_eq!(versions, vec![1, 2]);

        let _ = actor;
    }
}
