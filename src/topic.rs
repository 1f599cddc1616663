// SPDX-License-Identifier: MIT OR Apache-2.0

//! The topic record and the arbitration rules of the allocation CRDT.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::future::FutureId;
use crate::name::{SubjectId, TopicId, subject_id};
use crate::platform::{Micros, Priority, TopicParams, Transfer};

/// Default transfer-id timeout requested from the transport when a
/// subscriber does not specify one.
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Micros = 2_000_000;

/// Handle of one subscription on a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Reception parameters of a subscription. Multiple subscriptions on one
/// topic merge into a single transport subscription carrying the maxima.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionParams {
    /// Payload extent (maximum size) the subscriber wants reassembled.
    pub extent: usize,
    /// How long the transport keeps partial reassembly state per remote.
    pub transfer_id_timeout: Micros,
}

impl Default for SubscriptionParams {
    fn default() -> Self {
        Self {
            extent: 0,
            transfer_id_timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    /// Internal subscriptions (the heartbeat receive path) produce no
    /// [`crate::Event::Sample`] events.
    pub(crate) internal: bool,
}

/// One named topic: its identity, its place in the allocation CRDT and its
/// local pub/sub state. `S` is the transport extension created by
/// [`crate::Platform::topic_new`].
#[derive(Debug)]
pub struct Topic<S> {
    pub(crate) name: String,
    pub(crate) hash: TopicId,

    /// Lamport clock of lost arbitrations; shifts the subject identifier by
    /// one slot per loss.
    pub(crate) evictions: u64,
    /// Entrenchment counter. Compared through `floor(log2)` so replicas with
    /// different gossip counts still agree.
    pub(crate) age: u64,
    pub(crate) aged_at: Micros,

    /// Time of the last outbound gossip of this topic. Zero (or one, for
    /// deprioritized pinned topics) means "scheduled to gossip ASAP".
    pub(crate) last_gossip: Micros,
    /// Insertion sequence in the gossip index; makes equal gossip times FIFO.
    pub(crate) gossip_seq: u64,

    /// When any conflict touching this topic was last observed.
    pub(crate) last_event_ts: Micros,
    /// When this replica last had to change its own allocation.
    pub(crate) last_local_event_ts: Micros,

    pub(crate) pub_transfer_id: u64,
    pub(crate) pub_priority: Priority,
    pub(crate) publishing: bool,

    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) sub_extent: usize,
    pub(crate) sub_transfer_id_timeout: Micros,
    /// Whether the transport-level subscription is currently active. May
    /// transiently disagree with `subscriptions` being non-empty when a
    /// re-subscription after an allocation change failed.
    pub(crate) subscribed: bool,

    pub(crate) futures_by_transfer_id: BTreeMap<u64, FutureId>,
    pub(crate) last_sample: Option<Transfer>,

    pub(crate) state: S,
}

impl<S> Topic<S> {
    pub(crate) fn new(
        name: String,
        hash: TopicId,
        evictions: u64,
        now: Micros,
        pub_transfer_id: u64,
        event_ts: Micros,
        state: S,
    ) -> Self {
        Self {
            name,
            hash,
            evictions,
            age: 0,
            aged_at: now,
            last_gossip: 0,
            gossip_seq: 0,
            last_event_ts: event_ts,
            last_local_event_ts: event_ts,
            pub_transfer_id,
            pub_priority: Priority::Nominal,
            publishing: false,
            subscriptions: Vec::new(),
            sub_extent: 0,
            sub_transfer_id_timeout: 0,
            subscribed: false,
            futures_by_transfer_id: BTreeMap::new(),
            last_sample: None,
            state,
        }
    }

    /// Canonical topic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier (the name hash).
    pub fn id(&self) -> TopicId {
        self.hash
    }

    /// Current subject identifier, derived from the hash and the eviction
    /// counter.
    pub fn subject_id(&self) -> SubjectId {
        subject_id(self.hash, self.evictions)
    }

    pub fn discriminator(&self) -> u64 {
        self.hash.discriminator()
    }

    pub fn is_pinned(&self) -> bool {
        self.hash.is_pinned()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    /// Whether this node has published on the topic.
    pub fn publishing(&self) -> bool {
        self.publishing
    }

    /// Whether the transport-level receive path is active.
    pub fn subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    /// When any conflict touching this topic was last observed.
    pub fn last_event_ts(&self) -> Micros {
        self.last_event_ts
    }

    /// When this replica last had to change its own allocation.
    pub fn last_local_event_ts(&self) -> Micros {
        self.last_local_event_ts
    }

    /// The most recently received transfer, kept until the next one arrives.
    pub fn last_sample(&self) -> Option<&Transfer> {
        self.last_sample.as_ref()
    }

    /// Take ownership of the most recently received transfer.
    pub fn take_last_sample(&mut self) -> Option<Transfer> {
        self.last_sample.take()
    }

    pub fn pub_priority(&self) -> Priority {
        self.pub_priority
    }

    pub fn set_pub_priority(&mut self, priority: Priority) {
        self.pub_priority = priority;
    }

    /// Transport extension state.
    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    pub(crate) fn params(&self) -> TopicParams {
        TopicParams {
            subject_id: self.subject_id(),
            discriminator: self.hash.discriminator(),
            extent: self.sub_extent,
            transfer_id_timeout: self.sub_transfer_id_timeout,
        }
    }

    /// Age by wall-clock time: at most one increment per second, however
    /// rarely the topic gets gossiped.
    pub(crate) fn age_by_time(&mut self, now: Micros) {
        let seconds = (now - self.aged_at) / 1_000_000;
        debug_assert!(seconds >= 0);
        if seconds > 0 {
            self.age += 1;
            self.aged_at += seconds * 1_000_000;
        }
    }

    pub(crate) fn merge_age(&mut self, other: u64) {
        self.age = self.age.max(other);
    }
}

/// Floor of the binary logarithm, with `-1` for zero so the result is
/// linearly comparable.
pub(crate) fn log2_floor(x: u64) -> i8 {
    x.checked_ilog2().map_or(-1, |v| v as i8)
}

/// Arbitration between two topics with different hashes competing for one
/// subject identifier. Returns true when the left side keeps the slot.
pub(crate) fn collision_wins(
    left_hash: TopicId,
    left_age: u64,
    right_hash: TopicId,
    right_age: u64,
) -> bool {
    debug_assert_ne!(left_hash, right_hash);
    if left_hash.is_pinned() != right_hash.is_pinned() {
        return left_hash.is_pinned();
    }
    let left_lage = log2_floor(left_age);
    let right_lage = log2_floor(right_age);
    if left_lage == right_lage {
        return left_hash < right_hash;
    }
    left_lage > right_lage // the older topic is more entrenched
}

/// Merge rule for two replicas of the same topic that settled on different
/// eviction counters. Returns true when the left side keeps its allocation.
pub(crate) fn divergence_wins(
    left_age: u64,
    left_evictions: u64,
    right_age: u64,
    right_evictions: u64,
) -> bool {
    let left_lage = log2_floor(left_age);
    let right_lage = log2_floor(right_age);
    left_lage > right_lage || (left_lage == right_lage && left_evictions > right_evictions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log2_floor_of_zero_is_negative() {
        assert_eq!(log2_floor(0), -1);
        assert_eq!(log2_floor(1), 0);
        assert_eq!(log2_floor(2), 1);
        assert_eq!(log2_floor(3), 1);
        assert_eq!(log2_floor(u64::MAX), 63);
    }

    #[test]
    fn pinned_beats_everything() {
        let pinned = TopicId::new(42);
        let hashed = TopicId::new(0xdead_beef_0000_0000);
        assert!(collision_wins(pinned, 0, hashed, u64::MAX));
        assert!(!collision_wins(hashed, u64::MAX, pinned, 0));
    }

    #[test]
    fn older_topic_wins_collisions() {
        let a = TopicId::new(0xaaaa_0000_0000_0000);
        let b = TopicId::new(0xbbbb_0000_0000_0000);
        assert!(collision_wins(a, 8, b, 3));
        assert!(!collision_wins(a, 3, b, 8));
        // Same log-age bucket: 2 and 3 both floor to 1.
        assert!(collision_wins(a, 2, b, 3));
        assert!(!collision_wins(b, 2, a, 3));
    }

    #[test]
    fn collision_ties_break_by_smaller_hash() {
        let small = TopicId::new(0x1111_0000_0000_0000);
        let large = TopicId::new(0x2222_0000_0000_0000);
        assert!(collision_wins(small, 0, large, 0));
        assert!(!collision_wins(large, 0, small, 0));
    }

    #[test]
    fn divergence_prefers_age_then_evictions() {
        assert!(divergence_wins(8, 0, 3, 5));
        assert!(!divergence_wins(3, 5, 8, 0));
        // Equal log-age: the later-evicted replica knows more.
        assert!(divergence_wins(2, 7, 3, 4));
        assert!(!divergence_wins(2, 4, 3, 7));
        // Full tie is not a win.
        assert!(!divergence_wins(1, 4, 1, 4));
    }

    #[test]
    fn time_based_aging_is_capped_at_one_per_second() {
        let mut topic: Topic<()> =
            Topic::new("t".to_owned(), TopicId::new(0xffff_ffff), 0, 0, 0, 0, ());
        topic.age_by_time(500_000);
        assert_eq!(topic.age, 0);
        topic.age_by_time(1_000_000);
        assert_eq!(topic.age, 1);
        // A five-second gap still counts once.
        topic.age_by_time(6_000_000);
        assert_eq!(topic.age, 2);
        assert_eq!(topic.aged_at, 6_000_000);
    }
}
