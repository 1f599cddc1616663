// SPDX-License-Identifier: MIT OR Apache-2.0

//! The topic table: one primary store ordered by hash, plus secondary
//! indices by subject identifier and by gossip time.
//!
//! The gossip index orders topics by `(last_gossip, insertion sequence)`.
//! The monotone sequence makes topics with equal gossip times come out in
//! the order they entered that state, so topics scheduled "ASAP" (time zero)
//! are served FIFO.

use std::collections::{BTreeMap, BTreeSet};

use crate::name::{SubjectId, TopicId};
use crate::platform::Micros;
use crate::topic::Topic;

#[derive(Debug)]
pub(crate) struct TopicDirectory<S> {
    topics: BTreeMap<TopicId, Topic<S>>,
    by_subject: BTreeMap<SubjectId, TopicId>,
    by_gossip: BTreeSet<(Micros, u64, TopicId)>,
    gossip_seq: u64,
}

impl<S> Default for TopicDirectory<S> {
    fn default() -> Self {
        Self {
            topics: BTreeMap::new(),
            by_subject: BTreeMap::new(),
            by_gossip: BTreeSet::new(),
            gossip_seq: 0,
        }
    }
}

impl<S> TopicDirectory<S> {
    pub(crate) fn len(&self) -> usize {
        self.topics.len()
    }

    pub(crate) fn contains(&self, id: TopicId) -> bool {
        self.topics.contains_key(&id)
    }

    pub(crate) fn get(&self, id: TopicId) -> Option<&Topic<S>> {
        self.topics.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: TopicId) -> Option<&mut Topic<S>> {
        self.topics.get_mut(&id)
    }

    /// Topics in hash order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Topic<S>> {
        self.topics.values()
    }

    /// Insert a new topic into the primary store and the gossip index,
    /// scheduled to gossip ASAP. The subject index is populated separately
    /// by the allocation algorithm.
    pub(crate) fn insert(&mut self, mut topic: Topic<S>) {
        let id = topic.hash;
        debug_assert!(!self.topics.contains_key(&id));
        topic.last_gossip = 0;
        topic.gossip_seq = self.gossip_seq;
        self.gossip_seq += 1;
        self.by_gossip.insert((0, topic.gossip_seq, id));
        self.topics.insert(id, topic);
    }

    /// Remove a topic from all indices and return it.
    pub(crate) fn remove(&mut self, id: TopicId) -> Option<Topic<S>> {
        let topic = self.topics.remove(&id)?;
        self.by_gossip
            .remove(&(topic.last_gossip, topic.gossip_seq, id));
        if self.by_subject.get(&topic.subject_id()) == Some(&id) {
            self.by_subject.remove(&topic.subject_id());
        }
        Some(topic)
    }

    pub(crate) fn find_by_subject(&self, subject_id: SubjectId) -> Option<TopicId> {
        self.by_subject.get(&subject_id).copied()
    }

    /// Bind a subject identifier to a topic. The slot must be free.
    pub(crate) fn claim_subject(&mut self, subject_id: SubjectId, id: TopicId) {
        let prev = self.by_subject.insert(subject_id, id);
        debug_assert!(prev.is_none(), "subject {subject_id} was already claimed");
    }

    /// Drop the subject binding of a topic, if present. Must be called
    /// before the eviction counter changes.
    pub(crate) fn release_subject(&mut self, id: TopicId) {
        let Some(topic) = self.topics.get(&id) else {
            return;
        };
        let subject_id = topic.subject_id();
        if self.by_subject.get(&subject_id) == Some(&id) {
            self.by_subject.remove(&subject_id);
        }
    }

    /// The topic with the smallest `(last_gossip, seq)`, i.e. the one whose
    /// announcement is most overdue.
    pub(crate) fn next_to_gossip(&self) -> Option<TopicId> {
        self.by_gossip.first().map(|&(_, _, id)| id)
    }

    /// Move a topic to a new position in the gossip index.
    pub(crate) fn set_gossip_time(&mut self, id: TopicId, ts: Micros) {
        let Some(topic) = self.topics.get_mut(&id) else {
            return;
        };
        self.by_gossip
            .remove(&(topic.last_gossip, topic.gossip_seq, id));
        topic.last_gossip = ts;
        topic.gossip_seq = self.gossip_seq;
        self.gossip_seq += 1;
        self.by_gossip.insert((ts, topic.gossip_seq, id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(hash: u64) -> Topic<()> {
        Topic::new(format!("t{hash}"), TopicId::new(hash), 0, 0, 0, 0, ())
    }

    #[test]
    fn gossip_order_is_fifo_among_equal_times() {
        let mut directory = TopicDirectory::default();
        let a = TopicId::new(30_000);
        let b = TopicId::new(20_000);
        let c = TopicId::new(10_000);
        directory.insert(topic(30_000));
        directory.insert(topic(20_000));
        directory.insert(topic(10_000));

        // All three are due ASAP; insertion order wins, not hash order.
        assert_eq!(directory.next_to_gossip(), Some(a));
        directory.set_gossip_time(a, 100);
        assert_eq!(directory.next_to_gossip(), Some(b));
        directory.set_gossip_time(b, 100);
        assert_eq!(directory.next_to_gossip(), Some(c));
        directory.set_gossip_time(c, 100);

        // Equal real timestamps rotate in update order as well.
        assert_eq!(directory.next_to_gossip(), Some(a));
    }

    #[test]
    fn rescheduling_to_zero_preempts_real_times() {
        let mut directory = TopicDirectory::default();
        let a = TopicId::new(10_000);
        let b = TopicId::new(20_000);
        directory.insert(topic(10_000));
        directory.insert(topic(20_000));
        directory.set_gossip_time(a, 50);
        directory.set_gossip_time(b, 60);

        directory.set_gossip_time(b, 0);
        assert_eq!(directory.next_to_gossip(), Some(b));
    }

    #[test]
    fn removal_clears_all_indices() {
        let mut directory = TopicDirectory::default();
        let id = TopicId::new(10_000);
        directory.insert(topic(10_000));
        let subject = directory.get(id).unwrap().subject_id();
        directory.claim_subject(subject, id);

        let removed = directory.remove(id).unwrap();
        assert_eq!(removed.id(), id);
        assert_eq!(directory.len(), 0);
        assert_eq!(directory.find_by_subject(subject), None);
        assert_eq!(directory.next_to_gossip(), None);
    }
}
