//! Subscriber set and partition fan-out.
//!
//! Owns the connected endpoints of one subscription, the per-partition pending
//! queues, the in-flight bookkeeping, and the contiguous checkpoint. Everything
//! here is synchronous, pure state manipulation; the subscription state machine
//! drives it and performs the actual sends and persistence.
//!
//! Keeping one ordered queue per partition key is what makes partition affinity
//! and global ordering cheap: choosing the next partition is a peek at each head,
//! and re-queueing a dead endpoint's in-flight events is a prepend to the queues
//! they came from.

use std::collections::{BTreeSet, HashMap, VecDeque};

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::subscription::Endpoint;
use crate::types::{PartitionBy, RecordedEvent, Selector};

/// Partition key of an event: `None` when no partitioning is configured.
///
/// Unpartitioned events carry no affinity and are distributed round-robin;
/// `Some` keys pin delivery to one endpoint at a time while any event of that
/// key is in flight.
pub(crate) type PartitionKey = Option<String>;

/// An event paired with the position it occupies in this subscription's ordering
/// (stream version for a named stream, event number for `$all`).
#[derive(Debug, Clone)]
pub(crate) struct Sequenced {
    pub seq: i64,
    pub event: RecordedEvent,
}

/// One connected endpoint and its delivery window.
struct Subscriber {
    endpoint: Endpoint,
    buffer_size: usize,
    /// Delivered, unacknowledged events in delivery order, each remembering the
    /// partition it came from so endpoint death can re-queue it there.
    in_flight: VecDeque<(Sequenced, PartitionKey)>,
    /// Logical timestamp of the most recent delivery; 0 until the first one.
    last_delivery: u64,
    /// Insertion order, used as the round-robin tie-break.
    joined: u64,
}

impl Subscriber {
    fn available(&self) -> bool {
        self.in_flight.len() < self.buffer_size
    }

    fn holds_partition(&self, key: &PartitionKey) -> bool {
        self.in_flight.iter().any(|(_, held)| held == key)
    }
}

/// The delivery state of one subscription: endpoints, pending partitions,
/// in-flight events, and the processed-position set feeding the contiguous
/// checkpoint.
pub(crate) struct SubscriberSet {
    subscribers: HashMap<Uuid, Subscriber>,
    partitions: HashMap<PartitionKey, VecDeque<Sequenced>>,
    queue_size: usize,
    /// Positions processed out of order (acknowledged, or dropped by the
    /// selector) that the checkpoint has not yet caught up to.
    processed: BTreeSet<i64>,
    /// Highest position ingested by the delivery pipeline (queued, in flight,
    /// or selector-dropped).
    last_sent: i64,
    clock: u64,
    next_join: u64,
}

impl SubscriberSet {
    pub(crate) fn new(last_sent: i64) -> Self {
        Self {
            subscribers: HashMap::new(),
            partitions: HashMap::new(),
            queue_size: 0,
            processed: BTreeSet::new(),
            last_sent,
            clock: 0,
            next_join: 0,
        }
    }

    pub(crate) fn last_sent(&self) -> i64 {
        self.last_sent
    }

    pub(crate) fn set_last_sent(&mut self, last_sent: i64) {
        self.last_sent = last_sent;
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub(crate) fn contains(&self, endpoint_id: Uuid) -> bool {
        self.subscribers.contains_key(&endpoint_id)
    }

    pub(crate) fn endpoint(&self, endpoint_id: Uuid) -> Option<&Endpoint> {
        self.subscribers
            .get(&endpoint_id)
            .map(|subscriber| &subscriber.endpoint)
    }

    pub(crate) fn endpoint_ids(&self) -> Vec<Uuid> {
        self.subscribers.keys().copied().collect()
    }

    /// Register an endpoint. Returns `false` if it is already registered.
    pub(crate) fn insert_subscriber(&mut self, endpoint: Endpoint, buffer_size: usize) -> bool {
        if self.subscribers.contains_key(&endpoint.id()) {
            return false;
        }
        let joined = self.next_join;
        self.next_join += 1;
        self.subscribers.insert(
            endpoint.id(),
            Subscriber {
                endpoint,
                buffer_size,
                in_flight: VecDeque::new(),
                last_delivery: 0,
                joined,
            },
        );
        true
    }

    /// Remove an endpoint, prepending its in-flight events back onto their
    /// partition queues (in descending order, so each queue's head stays the
    /// lowest position). Returns `false` if the endpoint was not registered.
    pub(crate) fn remove_subscriber(&mut self, endpoint_id: Uuid) -> bool {
        let Some(subscriber) = self.subscribers.remove(&endpoint_id) else {
            return false;
        };
        for (event, key) in subscriber.in_flight.into_iter().rev() {
            self.partitions.entry(key).or_default().push_front(event);
            self.queue_size += 1;
        }
        true
    }

    /// Append a batch (in arrival order) onto the partition queues.
    ///
    /// Every ingested position advances `last_sent`, whether the event is
    /// queued or dropped by the selector, so catch-up reads resume past this
    /// batch instead of re-reading events that are still queued. Rejected
    /// events are additionally marked processed so the checkpoint can move
    /// past them without any delivery.
    pub(crate) fn enqueue(
        &mut self,
        batch: Vec<Sequenced>,
        selector: Option<&Selector>,
        partition_by: Option<&PartitionBy>,
    ) {
        for sequenced in batch {
            if sequenced.seq <= self.last_sent {
                continue;
            }
            if let Some(selector) = selector
                && !selector(&sequenced.event)
            {
                self.processed.insert(sequenced.seq);
                self.last_sent = sequenced.seq;
                continue;
            }
            let key = partition_by.map(|derive| derive(&sequenced.event));
            self.last_sent = sequenced.seq;
            self.partitions.entry(key).or_default().push_back(sequenced);
            self.queue_size += 1;
        }
    }

    /// Drain as much of the pending queues as endpoint windows allow.
    ///
    /// Partitions are visited in ascending order of their head position so the
    /// global ordering is preferred. Within a partition, events go to the
    /// endpoint already holding that partition's in-flight events (if any),
    /// otherwise to the available endpoint that has waited longest since its
    /// last delivery.
    ///
    /// Returns one batch per endpoint, in delivery order; the caller transmits
    /// each as a single message.
    pub(crate) fn fan_out(&mut self) -> Vec<(Uuid, Vec<RecordedEvent>)> {
        let mut heads: Vec<(i64, PartitionKey)> = self
            .partitions
            .iter()
            .filter_map(|(key, queue)| queue.front().map(|head| (head.seq, key.clone())))
            .collect();
        heads.sort_by(|a, b| a.0.cmp(&b.0));

        let mut deliveries: Vec<(Uuid, Vec<RecordedEvent>)> = Vec::new();

        for (_, key) in heads {
            loop {
                let has_pending = self
                    .partitions
                    .get(&key)
                    .is_some_and(|queue| !queue.is_empty());
                if !has_pending {
                    break;
                }
                let Some(endpoint_id) = self.select_endpoint(&key) else {
                    break;
                };

                let sequenced = self
                    .partitions
                    .get_mut(&key)
                    .and_then(|queue| queue.pop_front())
                    .expect("partition head checked above");
                self.queue_size -= 1;
                self.last_sent = self.last_sent.max(sequenced.seq);

                self.clock += 1;
                let subscriber = self
                    .subscribers
                    .get_mut(&endpoint_id)
                    .expect("selected endpoint is registered");
                subscriber.last_delivery = self.clock;
                subscriber
                    .in_flight
                    .push_back((sequenced.clone(), key.clone()));

                match deliveries.iter_mut().find(|(id, _)| *id == endpoint_id) {
                    Some((_, events)) => events.push(sequenced.event),
                    None => deliveries.push((endpoint_id, vec![sequenced.event])),
                }
            }
        }

        self.partitions.retain(|_, queue| !queue.is_empty());
        deliveries
    }

    /// Pick the endpoint for the next event of `key`, or `None` if fan-out must
    /// stop for this partition this round.
    fn select_endpoint(&self, key: &PartitionKey) -> Option<Uuid> {
        if key.is_some() {
            // Affinity: while any event of this key is in flight, only its
            // holder may receive more of it.
            if let Some((id, holder)) = self
                .subscribers
                .iter()
                .find(|(_, subscriber)| subscriber.holds_partition(key))
            {
                return holder.available().then_some(*id);
            }
        }

        self.subscribers
            .iter()
            .filter(|(_, subscriber)| subscriber.available())
            .min_by_key(|(_, subscriber)| (subscriber.last_delivery, subscriber.joined))
            .map(|(id, _)| *id)
    }

    /// Apply an acknowledgement from `endpoint_id` covering every in-flight
    /// event at or below `seq`, in order. Returns how many events were popped.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSubscriber`] if the endpoint is not registered.
    /// - [`Error::InvalidAck`] if nothing was popped and `seq` is above the
    ///   current watermark `last_ack`.
    pub(crate) fn ack(&mut self, endpoint_id: Uuid, seq: i64, last_ack: i64) -> Result<usize> {
        let subscriber = self
            .subscribers
            .get_mut(&endpoint_id)
            .ok_or(Error::UnknownSubscriber { endpoint_id })?;

        let mut popped = 0;
        while subscriber
            .in_flight
            .front()
            .is_some_and(|(event, _)| event.seq <= seq)
        {
            let (event, _) = subscriber
                .in_flight
                .pop_front()
                .expect("front checked above");
            self.processed.insert(event.seq);
            popped += 1;
        }

        if popped == 0 {
            if seq <= last_ack {
                // A replay of an already-checkpointed position; harmless.
                return Ok(0);
            }
            return Err(Error::InvalidAck { seq });
        }
        Ok(popped)
    }

    /// Advance the contiguous checkpoint: starting from `last_ack + 1`, consume
    /// consecutive processed positions and return the new watermark.
    pub(crate) fn checkpoint(&mut self, last_ack: i64) -> i64 {
        let mut watermark = last_ack;
        while self.processed.remove(&(watermark + 1)) {
            watermark += 1;
        }
        watermark
    }

    /// Discard all volatile delivery state (pending queues, in-flight events,
    /// processed positions), keeping the registered endpoints. Used when
    /// subscription leadership is lost.
    pub(crate) fn purge(&mut self) {
        self.partitions.clear();
        self.queue_size = 0;
        self.processed.clear();
        for subscriber in self.subscribers.values_mut() {
            subscriber.in_flight.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Endpoint;
    use crate::types::{PartitionBy, Selector};
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::Arc;

    fn sequenced(seq: i64, payload: &str) -> Sequenced {
        Sequenced {
            seq,
            event: RecordedEvent {
                event_id: uuid::Uuid::new_v4(),
                event_number: seq,
                stream_id: "s".to_string(),
                stream_version: seq,
                event_type: "TestEvt".to_string(),
                metadata: Bytes::new(),
                payload: Bytes::copy_from_slice(payload.as_bytes()),
                created_at: Utc::now(),
            },
        }
    }

    fn batch(range: std::ops::RangeInclusive<i64>) -> Vec<Sequenced> {
        range.map(|seq| sequenced(seq, "{}")).collect()
    }

    /// Partition by the event payload, so tests can steer keys directly.
    fn by_payload() -> PartitionBy {
        Arc::new(|event: &RecordedEvent| String::from_utf8_lossy(&event.payload).into_owned())
    }

    fn endpoint() -> Endpoint {
        // The set never sends in these tests, so the receiver can be dropped.
        let (endpoint, _rx) = Endpoint::channel();
        endpoint
    }

    #[test]
    fn single_endpoint_receives_batch_in_order() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        set.enqueue(batch(1..=5), None, None);
        assert_eq!(set.queue_size(), 5);

        let deliveries = set.fan_out();
        assert_eq!(deliveries.len(), 1);
        let (id, events) = &deliveries[0];
        assert_eq!(*id, e.id());
        let seqs: Vec<i64> = events.iter().map(|event| event.stream_version).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(set.queue_size(), 0);
        assert_eq!(set.last_sent(), 5);
    }

    #[test]
    fn buffer_size_caps_in_flight() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 2);

        set.enqueue(batch(1..=5), None, None);
        let deliveries = set.fan_out();
        assert_eq!(deliveries[0].1.len(), 2, "only buffer_size events delivered");
        assert_eq!(set.queue_size(), 3);

        // Acking both frees the window for the next two.
        set.ack(e.id(), 2, 0).expect("ack should succeed");
        let deliveries = set.fan_out();
        assert_eq!(deliveries[0].1.len(), 2);
        assert_eq!(set.queue_size(), 1);
    }

    #[test]
    fn unpartitioned_events_round_robin_fairly() {
        let mut set = SubscriberSet::new(0);
        let endpoints: Vec<Endpoint> = (0..3).map(|_| endpoint()).collect();
        for e in &endpoints {
            set.insert_subscriber(e.clone(), 10);
        }

        set.enqueue(batch(1..=9), None, None);
        let deliveries = set.fan_out();

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for (id, events) in &deliveries {
            *counts.entry(*id).or_default() += events.len();
        }
        for e in &endpoints {
            assert_eq!(
                counts.get(&e.id()),
                Some(&3),
                "each endpoint should receive exactly 3 of 9 events"
            );
        }
    }

    #[test]
    fn two_endpoints_buffer_one_alternate() {
        let mut set = SubscriberSet::new(0);
        let e1 = endpoint();
        let e2 = endpoint();
        set.insert_subscriber(e1.clone(), 1);
        set.insert_subscriber(e2.clone(), 1);

        set.enqueue(batch(1..=4), None, None);
        let deliveries = set.fan_out();
        assert_eq!(deliveries.len(), 2, "both endpoints get one event each");
        assert_eq!(set.queue_size(), 2, "the rest waits for acks");

        let first_owner = deliveries[0].0;
        set.ack(first_owner, deliveries[0].1[0].stream_version, 0)
            .expect("ack");
        let next = set.fan_out();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, first_owner, "freed endpoint takes the next event");
    }

    #[test]
    fn selector_rejections_mark_processed_and_advance_last_sent() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        let odd_only: Selector = Arc::new(|event| event.stream_version % 2 == 1);
        set.enqueue(batch(1..=6), Some(&odd_only), None);

        assert_eq!(set.queue_size(), 3);
        assert_eq!(set.last_sent(), 6, "rejected tail advances last_sent");

        let deliveries = set.fan_out();
        let seqs: Vec<i64> = deliveries[0]
            .1
            .iter()
            .map(|event| event.stream_version)
            .collect();
        assert_eq!(seqs, vec![1, 3, 5]);

        // Acking the last odd event completes the contiguous prefix 1..=6.
        set.ack(e.id(), 5, 0).expect("ack");
        assert_eq!(set.checkpoint(0), 6);
    }

    #[test]
    fn partition_affinity_pins_key_to_holder() {
        let mut set = SubscriberSet::new(0);
        let e1 = endpoint();
        let e2 = endpoint();
        set.insert_subscriber(e1.clone(), 1);
        set.insert_subscriber(e2.clone(), 1);

        let by = by_payload();
        // Two events of partition A: the second must wait for the first's ack
        // even though the other endpoint is idle.
        set.enqueue(
            vec![sequenced(1, "A"), sequenced(2, "A")],
            None,
            Some(&by),
        );
        let deliveries = set.fan_out();
        assert_eq!(deliveries.len(), 1, "second A event must not go elsewhere");
        let owner = deliveries[0].0;
        assert_eq!(deliveries[0].1.len(), 1);
        assert_eq!(set.queue_size(), 1);

        set.ack(owner, 1, 0).expect("ack");
        let next = set.fan_out();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].1[0].stream_version, 2);
    }

    #[test]
    fn interleaved_partitions_go_to_distinct_endpoints() {
        let mut set = SubscriberSet::new(0);
        let e1 = endpoint();
        let e2 = endpoint();
        set.insert_subscriber(e1.clone(), 1);
        set.insert_subscriber(e2.clone(), 1);

        let by = by_payload();
        set.enqueue(
            vec![
                sequenced(1, "A"),
                sequenced(2, "B"),
                sequenced(3, "A"),
                sequenced(4, "B"),
                sequenced(5, "C"),
            ],
            None,
            Some(&by),
        );

        let deliveries = set.fan_out();
        assert_eq!(deliveries.len(), 2);
        let a_owner = deliveries[0].0;
        let b_owner = deliveries[1].0;
        assert_ne!(a_owner, b_owner);
        assert_eq!(deliveries[0].1[0].stream_version, 1);
        assert_eq!(deliveries[1].1[0].stream_version, 2);
        // Events 3, 4, 5 wait: A and B are pinned to busy holders, C has no
        // available endpoint.
        assert_eq!(set.queue_size(), 3);

        // A's holder acks: it must receive event 3 (same key), not B's.
        set.ack(a_owner, 1, 0).expect("ack a");
        let next = set.fan_out();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].0, a_owner);
        assert_eq!(next[0].1[0].stream_version, 3);

        // B's holder acks: receives event 4.
        set.ack(b_owner, 2, 0).expect("ack b");
        let next = set.fan_out();
        assert_eq!(next[0].0, b_owner);
        assert_eq!(next[0].1[0].stream_version, 4);
    }

    #[test]
    fn ack_covers_every_in_flight_event_at_or_below() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        set.enqueue(batch(1..=4), None, None);
        set.fan_out();

        let popped = set.ack(e.id(), 3, 0).expect("cumulative ack");
        assert_eq!(popped, 3);
        assert_eq!(set.checkpoint(0), 3);
    }

    #[test]
    fn ack_from_unknown_endpoint_fails() {
        let mut set = SubscriberSet::new(0);
        let result = set.ack(uuid::Uuid::new_v4(), 1, 0);
        assert!(matches!(result, Err(Error::UnknownSubscriber { .. })));
    }

    #[test]
    fn stale_ack_below_watermark_is_ignored() {
        let mut set = SubscriberSet::new(5);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        let popped = set.ack(e.id(), 3, 5).expect("stale ack tolerated");
        assert_eq!(popped, 0);
    }

    #[test]
    fn ack_above_in_flight_is_invalid() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        let result = set.ack(e.id(), 7, 0);
        assert!(matches!(result, Err(Error::InvalidAck { seq: 7 })));
    }

    #[test]
    fn checkpoint_advances_only_contiguously() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        set.enqueue(batch(1..=3), None, None);
        set.fan_out();

        // Ack 1 then 3: position 2 is missing, so the watermark stops at 1.
        // (A single endpoint acks in order; out-of-order positions arise across
        // endpoints, emulated here by acking the head then skipping.)
        set.ack(e.id(), 1, 0).expect("ack 1");
        assert_eq!(set.checkpoint(0), 1);

        set.processed.insert(3);
        assert_eq!(set.checkpoint(1), 1, "gap at 2 blocks the watermark");

        set.processed.insert(2);
        assert_eq!(set.checkpoint(1), 3, "filling the gap releases the rest");
    }

    #[test]
    fn removing_an_endpoint_requeues_its_in_flight_in_order() {
        let mut set = SubscriberSet::new(0);
        let e1 = endpoint();
        let e2 = endpoint();
        set.insert_subscriber(e1.clone(), 2);

        let by = by_payload();
        set.enqueue(
            vec![sequenced(3, "A"), sequenced(4, "A")],
            None,
            Some(&by),
        );
        let deliveries = set.fan_out();
        assert_eq!(deliveries[0].1.len(), 2);
        assert_eq!(set.queue_size(), 0);

        // The endpoint dies with both events in flight.
        assert!(set.remove_subscriber(e1.id()));
        assert_eq!(set.queue_size(), 2, "in-flight events are re-queued");

        // A replacement endpoint receives them in the original order.
        set.insert_subscriber(e2.clone(), 2);
        let redelivered = set.fan_out();
        assert_eq!(redelivered[0].0, e2.id());
        let seqs: Vec<i64> = redelivered[0]
            .1
            .iter()
            .map(|event| event.stream_version)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn purge_clears_volatile_state_but_keeps_endpoints() {
        let mut set = SubscriberSet::new(0);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 1);

        set.enqueue(batch(1..=3), None, None);
        set.fan_out();
        set.purge();

        assert_eq!(set.queue_size(), 0);
        assert!(set.contains(e.id()));
        assert_eq!(set.checkpoint(0), 0, "processed positions are gone");

        // Post-purge the endpoint window is empty again.
        set.enqueue(batch(4..=4), None, None);
        let deliveries = set.fan_out();
        assert_eq!(deliveries[0].1[0].stream_version, 4);
    }

    #[test]
    fn enqueue_skips_positions_already_handed_out() {
        let mut set = SubscriberSet::new(3);
        let e = endpoint();
        set.insert_subscriber(e.clone(), 10);

        set.enqueue(batch(1..=5), None, None);
        assert_eq!(set.queue_size(), 2, "positions 1..=3 were already sent");

        let deliveries = set.fan_out();
        let seqs: Vec<i64> = deliveries[0]
            .1
            .iter()
            .map(|event| event.stream_version)
            .collect();
        assert_eq!(seqs, vec![4, 5]);
    }
}
