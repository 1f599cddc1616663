// SPDX-License-Identifier: MIT OR Apache-2.0

//! The local node: topic directory, allocation CRDT, gossip scheduler,
//! node-ID autoconfiguration and the ingest paths.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::Config;
use crate::directory::TopicDirectory;
use crate::error::Error;
use crate::event::{Event, ResponseOutcome};
use crate::future::{FutureId, FutureTable};
use crate::heartbeat::{HEARTBEAT_SIZE_MAX, Heartbeat};
use crate::name::{
    NAMESPACE_NAME_MAX, NameError, SubjectId, TOPIC_SUBJECT_COUNT, TopicId, canonicalize,
    subject_id, topic_hash,
};
use crate::platform::{
    Micros, NodeId, Platform, RESPONSE_SERVICE_ID, Transfer, TransferMetadata,
};
use crate::topic::{
    DEFAULT_TRANSFER_ID_TIMEOUT, Subscription, SubscriptionId, SubscriptionParams, Topic,
    collision_wins, divergence_wins,
};

/// Bounds of the random listen period before an autoconfiguring node sends
/// its first heartbeat.
const START_DELAY_MIN: Micros = 1_000_000;
const START_DELAY_MAX: Micros = 3_000_000;

/// Upper bound of the extra delay added per newly discovered neighbor while
/// the node has no identifier yet.
const NEIGHBOR_BACKOFF_MAX: Micros = 2_000_000;

/// Transmission deadline margin for heartbeats.
const HEARTBEAT_TX_TIMEOUT: Micros = 1_000_000;

/// A participant of the bus: one replica of the fleet-wide naming CRDT.
///
/// The node is single-threaded and sans-IO. The caller drives it by invoking
/// [`Node::update`] periodically, feeding received transfers through the
/// `ingest_*` entrypoints (ingest first, then update, when both are due) and
/// draining [`Node::next_event`] after every call into the core.
pub struct Node<P: Platform> {
    platform: P,

    uid: u64,
    namespace: String,
    node_name: String,
    user_word: [u8; 3],

    node_id: Option<NodeId>,
    /// Latched by [`Node::notify_node_id_collision`], acted upon on the next
    /// update tick.
    node_id_collision: bool,

    started_at: Micros,
    heartbeat_next: Micros,
    heartbeat_period_max: Micros,
    gossip_cycle_period_max: Micros,
    heartbeat_topic: TopicId,

    /// When any allocation conflict was last observed, fleet-wide.
    last_event_ts: Micros,
    /// When this node last had to change one of its own allocations.
    last_local_event_ts: Micros,

    directory: TopicDirectory<P::TopicState>,
    futures: FutureTable,
    events: VecDeque<Event>,
    next_subscription_id: u64,
}

impl<P: Platform> Node<P> {
    pub fn new(mut platform: P, config: Config) -> Result<Self, Error> {
        if config.uid == 0 {
            return Err(Error::ZeroUid);
        }
        if config.namespace.len() > NAMESPACE_NAME_MAX {
            return Err(NameError::PrefixTooLong(config.namespace.len()).into());
        }
        let node_name = config.node_name.unwrap_or_else(|| {
            format!(
                "{:04x}/{:04x}/{:08x}",
                (config.uid >> 48) & 0xffff,
                (config.uid >> 32) & 0xffff,
                config.uid & 0xffff_ffff
            )
        });
        if node_name.len() > NAMESPACE_NAME_MAX {
            return Err(NameError::PrefixTooLong(node_name.len()).into());
        }
        let namespace = if config.namespace.is_empty() {
            "/".to_owned()
        } else {
            config.namespace
        };
        let node_id = match config.node_id {
            None => None,
            Some(id) if id <= platform.node_id_max().get() => Some(NodeId::new(id)),
            Some(id) => return Err(Error::NodeIdOutOfRange(id, platform.node_id_max().get())),
        };

        let started_at = platform.now();
        platform.node_id_bloom().purge();

        let mut node = Self {
            platform,
            uid: config.uid,
            namespace,
            node_name,
            user_word: config.user_word,
            node_id,
            node_id_collision: false,
            started_at,
            heartbeat_next: started_at,
            heartbeat_period_max: config.heartbeat_period_max,
            gossip_cycle_period_max: config.gossip_cycle_period_max,
            heartbeat_topic: TopicId::new(0),
            last_event_ts: 0,
            last_local_event_ts: 0,
            directory: TopicDirectory::default(),
            futures: FutureTable::default(),
            events: VecDeque::new(),
            next_subscription_id: 0,
        };

        match node.node_id {
            Some(id) => {
                // Claim the address aggressively: the first heartbeat goes
                // out on the very first update tick. Explicit beats
                // autoconfigured.
                node.platform.node_id_bloom().insert(usize::from(id.get()));
                node.platform.node_id_set(id)?;
            }
            None => {
                // Listen before claiming anything.
                let delay =
                    node.random_range(START_DELAY_MIN as u64, START_DELAY_MAX as u64) as Micros;
                node.heartbeat_next += delay;
                node.last_event_ts = started_at;
                node.last_local_event_ts = started_at;
            }
        }

        let heartbeat_topic = node.create_topic(&config.heartbeat_topic, None)?;
        node.heartbeat_topic = heartbeat_topic;
        let subscription = SubscriptionId(node.next_subscription_id);
        node.next_subscription_id += 1;
        node.add_subscription(
            heartbeat_topic,
            subscription,
            SubscriptionParams {
                extent: HEARTBEAT_SIZE_MAX,
                transfer_id_timeout: DEFAULT_TRANSFER_ID_TIMEOUT,
            },
            true,
        )?;
        debug!(
            uid = format_args!("{:016x}", node.uid),
            node_id = ?node.node_id,
            heartbeat = %heartbeat_topic,
            "node initialized"
        );
        Ok(node)
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn started_at(&self) -> Micros {
        self.started_at
    }

    /// The pinned topic all gossip is carried on.
    pub fn heartbeat_topic(&self) -> TopicId {
        self.heartbeat_topic
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Pop the next queued event, if any. Drain after every call into the
    /// core.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Convergence heuristic: the node has an identifier and no allocation
    /// conflict has touched it for at least one full gossip cycle.
    pub fn ready(&mut self) -> bool {
        let now = self.platform.now();
        self.node_id.is_some() && now >= self.last_event_ts + self.gossip_cycle_period_max
    }

    // ---------------- topics ----------------

    /// Create a topic under the node's namespace.
    pub fn topic_new(&mut self, name: &str) -> Result<TopicId, Error> {
        self.create_topic(name, None)
    }

    /// Create a topic with a preferred subject identifier, typically restored
    /// from persistent storage for a warm start. The hint pre-seeds the
    /// eviction counter and is ignored for pinned topics, out-of-range
    /// values, or when arbitration decides otherwise.
    pub fn topic_new_with_hint(&mut self, name: &str, hint: SubjectId) -> Result<TopicId, Error> {
        self.create_topic(name, Some(hint))
    }

    /// Destroy a topic: drop it from all indices, cancel its pending
    /// response futures and release its transport state.
    pub fn topic_destroy(&mut self, topic: TopicId) -> Result<(), Error> {
        if topic == self.heartbeat_topic {
            return Err(Error::HeartbeatTopicProtected);
        }
        let mut record = self.directory.remove(topic).ok_or(Error::UnknownTopic)?;
        for (_, future) in std::mem::take(&mut record.futures_by_transfer_id) {
            self.futures.remove(future);
        }
        if record.subscribed {
            let params = record.params();
            self.platform.topic_unsubscribe(&mut record.state, params);
        }
        self.platform.topic_destroy(record.state);
        debug!(topic = %topic, count = self.directory.len(), "topic destroyed");
        Ok(())
    }

    /// Resolve a (not necessarily canonical) name to a local topic.
    pub fn find_by_name(&self, name: &str) -> Option<TopicId> {
        let canonical = canonicalize(&self.namespace, &self.node_name, name).ok()?;
        let hash = topic_hash(&canonical);
        self.directory.contains(hash).then_some(hash)
    }

    pub fn find_by_subject_id(&self, subject_id: SubjectId) -> Option<TopicId> {
        self.directory.find_by_subject(subject_id)
    }

    pub fn topic(&self, topic: TopicId) -> Option<&Topic<P::TopicState>> {
        self.directory.get(topic)
    }

    pub fn topic_mut(&mut self, topic: TopicId) -> Option<&mut Topic<P::TopicState>> {
        self.directory.get_mut(topic)
    }

    /// All local topics in hash order.
    pub fn topics(&self) -> impl Iterator<Item = &Topic<P::TopicState>> {
        self.directory.iter()
    }

    fn create_topic(&mut self, name: &str, hint: Option<SubjectId>) -> Result<TopicId, Error> {
        let canonical = canonicalize(&self.namespace, &self.node_name, name)?;
        let hash = topic_hash(&canonical);
        if self.directory.contains(hash) {
            return Err(Error::NameTaken);
        }
        if self.directory.len() >= usize::from(TOPIC_SUBJECT_COUNT) {
            return Err(Error::TopicCapacity);
        }
        let now = self.platform.now();
        let pub_transfer_id = self.random_u64();
        let state = self.platform.topic_new()?;

        let mut evictions = 0;
        let mut event_ts = 0;
        match hint.filter(|sid| !hash.is_pinned() && sid.get() < TOPIC_SUBJECT_COUNT) {
            Some(sid) => {
                // Lowest eviction counter that lands on the hinted subject;
                // sidesteps negative remainders.
                while subject_id(hash, evictions) != sid {
                    evictions += 1;
                }
            }
            None if !hash.is_pinned() => {
                // A fresh dynamic allocation is an event the rest of the
                // fleet has yet to agree with.
                event_ts = now;
                self.last_event_ts = now;
                self.last_local_event_ts = now;
            }
            None => {}
        }

        self.directory.insert(Topic::new(
            canonical,
            hash,
            evictions,
            now,
            pub_transfer_id,
            event_ts,
            state,
        ));
        self.allocate_topic(hash, evictions, true);
        let subject = self
            .directory
            .get(hash)
            .expect("the topic was just inserted")
            .subject_id();
        debug!(topic = %hash, %subject, count = self.directory.len(), "topic created");
        Ok(hash)
    }

    // ---------------- allocation CRDT ----------------

    /// (Re-)place a topic at the subject derived from `new_evictions`,
    /// arbitrating against residents. Displaced topics are processed from a
    /// work-list; the chain reaction terminates because every step strictly
    /// advances some eviction counter within a finite subject space.
    fn allocate_topic(&mut self, root: TopicId, new_evictions: u64, virgin: bool) {
        debug_assert!(self.directory.len() <= usize::from(TOPIC_SUBJECT_COUNT));
        self.prepare_for_placement(root, new_evictions, !virgin);
        let mut pending = vec![root];
        while let Some(&id) = pending.last() {
            let topic = self.directory.get(id).expect("pending topics exist");
            let (hash, age, subject) = (topic.hash, topic.age, topic.subject_id());
            match self.directory.find_by_subject(subject) {
                None => {
                    self.directory.claim_subject(subject, id);
                    pending.pop();
                    self.finish_placement(id);
                }
                Some(other) => {
                    let resident = self.directory.get(other).expect("indexed topics exist");
                    debug_assert_ne!(resident.hash, hash);
                    let (r_hash, r_age, r_evictions) =
                        (resident.hash, resident.age, resident.evictions);
                    if collision_wins(hash, age, r_hash, r_age) {
                        // Our slot; the resident moves first. A squatter the
                        // chain reaction deposits here meanwhile must lose to
                        // us again, so this topic stays queued and retries.
                        debug!(topic = %id, displaced = %other, %subject, "eviction");
                        self.prepare_for_placement(other, r_evictions + 1, true);
                        pending.push(other);
                    } else {
                        self.directory
                            .get_mut(id)
                            .expect("pending topics exist")
                            .evictions += 1;
                    }
                }
            }
        }
    }

    /// Take a topic out of the subject index and the transport receive path
    /// so its eviction counter can change.
    fn prepare_for_placement(&mut self, id: TopicId, target_evictions: u64, indexed: bool) {
        if indexed {
            self.directory.release_subject(id);
        }
        let Self {
            platform,
            directory,
            ..
        } = self;
        let Some(topic) = directory.get_mut(id) else {
            return;
        };
        if topic.subscribed {
            let params = topic.params();
            platform.topic_unsubscribe(&mut topic.state, params);
            topic.subscribed = false;
        }
        topic.evictions = target_evictions;
    }

    /// A topic settled on a subject: announce it and restore the receive
    /// path if anyone listens.
    fn finish_placement(&mut self, id: TopicId) {
        self.schedule_gossip_asap(id);
        let Self {
            platform,
            directory,
            events,
            ..
        } = self;
        let Some(topic) = directory.get_mut(id) else {
            return;
        };
        if topic.has_subscribers() {
            let params = topic.params();
            match platform.topic_subscribe(&mut topic.state, params) {
                Ok(()) => topic.subscribed = true,
                Err(error) => {
                    warn!(topic = %id, %error, "re-subscription failed");
                    events.push_back(Event::SubscriptionError { topic: id, error });
                }
            }
        }
    }

    fn schedule_gossip_asap(&mut self, id: TopicId) {
        let Some(topic) = self.directory.get(id) else {
            return;
        };
        let (last_gossip, pinned) = (topic.last_gossip, topic.hash.is_pinned());
        // Zero already means "pending ASAP"; keep the FIFO position.
        if last_gossip > 0 {
            trace!(topic = %id, "gossip rescheduled ASAP");
            // A pinned topic cannot genuinely collide; announcing it is less
            // urgent than announcing a contested allocation.
            self.directory.set_gossip_time(id, if pinned { 1 } else { 0 });
        }
    }

    // ---------------- pub/sub ----------------

    /// Register a subscription. The transport receive path is activated on
    /// the first subscriber and renegotiated when a later one needs more; a
    /// transport failure surfaces as [`Event::SubscriptionError`] and is
    /// retried on the next allocation event.
    pub fn subscribe(
        &mut self,
        topic: TopicId,
        params: SubscriptionParams,
    ) -> Result<SubscriptionId, Error> {
        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;
        self.add_subscription(topic, id, params, false)?;
        Ok(id)
    }

    fn add_subscription(
        &mut self,
        topic_id: TopicId,
        id: SubscriptionId,
        params: SubscriptionParams,
        internal: bool,
    ) -> Result<(), Error> {
        let Self {
            platform,
            directory,
            events,
            ..
        } = self;
        let topic = directory.get_mut(topic_id).ok_or(Error::UnknownTopic)?;
        // A wider extent or a longer transfer-id timeout requires the
        // transport subscription to be re-created.
        if topic.subscribed
            && (topic.sub_extent < params.extent
                || topic.sub_transfer_id_timeout < params.transfer_id_timeout)
        {
            let p = topic.params();
            platform.topic_unsubscribe(&mut topic.state, p);
            topic.subscribed = false;
        }
        topic.sub_extent = topic.sub_extent.max(params.extent);
        topic.sub_transfer_id_timeout = topic
            .sub_transfer_id_timeout
            .max(params.transfer_id_timeout);
        topic.subscriptions.push(Subscription { id, internal });
        if !topic.subscribed {
            let p = topic.params();
            match platform.topic_subscribe(&mut topic.state, p) {
                Ok(()) => topic.subscribed = true,
                Err(error) if internal => return Err(error.into()),
                Err(error) => {
                    warn!(topic = %topic_id, %error, "subscription failed, will retry on reallocation");
                    events.push_back(Event::SubscriptionError {
                        topic: topic_id,
                        error,
                    });
                }
            }
        }
        debug!(topic = %topic_id, subscription = %id, extent = params.extent, "subscribed");
        Ok(())
    }

    /// Remove a subscription. The transport-level subscription stays active
    /// until the next allocation event observes an empty subscriber list.
    pub fn unsubscribe(&mut self, topic: TopicId, subscription: SubscriptionId) -> bool {
        let Some(t) = self.directory.get_mut(topic) else {
            return false;
        };
        let before = t.subscriptions.len();
        t.subscriptions.retain(|s| s.id != subscription);
        t.subscriptions.len() != before
    }

    /// Publish one transfer.
    pub fn publish(
        &mut self,
        topic: TopicId,
        tx_deadline: Micros,
        payload: Bytes,
    ) -> Result<(), Error> {
        self.publish_inner(topic, tx_deadline, payload, None)
            .map(|_| ())
    }

    /// Publish one transfer and expect at most one response before the
    /// given deadline. Resolution is delivered as [`Event::Response`].
    pub fn publish_with_response(
        &mut self,
        topic: TopicId,
        tx_deadline: Micros,
        payload: Bytes,
        response_deadline: Micros,
    ) -> Result<FutureId, Error> {
        self.publish_inner(topic, tx_deadline, payload, Some(response_deadline))
            .map(|id| id.expect("a future was requested"))
    }

    fn publish_inner(
        &mut self,
        topic_id: TopicId,
        tx_deadline: Micros,
        payload: Bytes,
        response_deadline: Option<Micros>,
    ) -> Result<Option<FutureId>, Error> {
        if self.node_id.is_none() && self.platform.requires_node_id() {
            return Err(Error::Anonymous);
        }
        let mask = self.platform.transfer_id_mask();
        let Self {
            platform,
            directory,
            futures,
            ..
        } = self;
        let topic = directory.get_mut(topic_id).ok_or(Error::UnknownTopic)?;
        topic.publishing = true;

        // The future goes in first: with a cyclic transfer-id the window may
        // be exhausted, in which case nothing must be transmitted.
        let transfer_id = topic.pub_transfer_id;
        let mut future = None;
        if let Some(deadline) = response_deadline {
            let masked = transfer_id & mask;
            if topic.futures_by_transfer_id.contains_key(&masked) {
                return Err(Error::TransferIdExhausted);
            }
            let id = futures.allocate(topic_id, masked, deadline);
            topic.futures_by_transfer_id.insert(masked, id);
            future = Some((id, masked));
        }

        let params = topic.params();
        let priority = topic.pub_priority;
        let result = platform.topic_publish(
            &mut topic.state,
            params,
            priority,
            transfer_id,
            tx_deadline,
            payload,
        );
        match &result {
            Ok(()) => {
                if let Some((id, _)) = future {
                    futures.arm(id);
                }
            }
            Err(_) => {
                if let Some((id, masked)) = future {
                    topic.futures_by_transfer_id.remove(&masked);
                    futures.remove(id);
                }
            }
        }
        // The transfer-id increments even on failure: gaps tell subscribers
        // that transfers were lost.
        topic.pub_transfer_id = topic.pub_transfer_id.wrapping_add(1);
        result?;
        Ok(future.map(|(id, _)| id))
    }

    /// Reply to a received transfer. The reply travels as an RPC *request*
    /// on [`RESPONSE_SERVICE_ID`], prefixed with the topic hash; the RPC
    /// response channel stays free for a future delivery acknowledgement.
    pub fn respond(
        &mut self,
        topic: TopicId,
        tx_deadline: Micros,
        metadata: TransferMetadata,
        payload: &[u8],
    ) -> Result<(), Error> {
        let t = self.directory.get(topic).ok_or(Error::UnknownTopic)?;
        let mut framed = Vec::with_capacity(8 + payload.len());
        framed.extend_from_slice(&t.hash.get().to_le_bytes());
        framed.extend_from_slice(payload);
        self.platform
            .request(
                RESPONSE_SERVICE_ID,
                metadata,
                tx_deadline,
                Bytes::from(framed),
            )
            .map_err(Error::from)
    }

    /// Withdraw a pending response future without waiting for its deadline.
    pub fn cancel_response(&mut self, future: FutureId) -> bool {
        let Some(record) = self.futures.remove(future) else {
            return false;
        };
        if let Some(topic) = self.directory.get_mut(record.topic) {
            topic.futures_by_transfer_id.remove(&record.transfer_id_masked);
        }
        true
    }

    // ---------------- ingest ----------------

    /// Feed a reassembled transfer received on a topic's subject.
    pub fn ingest_topic_transfer(&mut self, topic: TopicId, transfer: Transfer) {
        self.mark_neighbor(transfer.metadata.remote_node_id);
        if !self.directory.contains(topic) {
            trace!(%topic, "transfer on unknown topic dropped");
            return;
        }
        if topic == self.heartbeat_topic {
            self.ingest_heartbeat(&transfer);
        }
        let Self {
            directory, events, ..
        } = self;
        let t = directory.get_mut(topic).expect("presence checked above");
        // Receive-side aging: an orphaned publisher cannot inflate its own
        // entrenchment.
        t.age += 1;
        if !t.has_subscribers() {
            return;
        }
        t.last_sample = Some(transfer);
        for sub in &t.subscriptions {
            if !sub.internal {
                events.push_back(Event::Sample {
                    topic,
                    subscription: sub.id,
                });
            }
        }
    }

    /// Feed a transfer received on the response RPC service.
    pub fn ingest_response_transfer(&mut self, transfer: Transfer) {
        self.mark_neighbor(transfer.metadata.remote_node_id);
        if transfer.payload.len() < 8 {
            trace!("malformed response transfer dropped");
            return;
        }
        let hash = TopicId::new(u64::from_le_bytes(
            transfer.payload[..8].try_into().expect("8-byte slice"),
        ));
        let masked = transfer.metadata.transfer_id & self.platform.transfer_id_mask();
        let Some(topic) = self.directory.get_mut(hash) else {
            trace!(topic = %hash, "response for unknown topic dropped");
            return;
        };
        let Some(future) = topic.futures_by_transfer_id.remove(&masked) else {
            trace!(topic = %hash, masked, "unexpected or duplicate response dropped");
            return;
        };
        self.futures.remove(future);
        let mut transfer = transfer;
        transfer.payload = transfer.payload.slice(8..);
        debug!(topic = %hash, future = %future, "response received");
        self.events.push_back(Event::Response {
            topic: hash,
            future,
            outcome: ResponseOutcome::Arrived(transfer),
        });
    }

    /// The transport saw a frame whose discriminator does not match the
    /// topic occupying its subject: re-announce our claim soon.
    pub fn notify_discriminator_collision(&mut self, topic: TopicId) {
        let Some(t) = self.directory.get(topic) else {
            return;
        };
        if t.last_gossip > 0 {
            debug!(%topic, subject = %t.subject_id(), "discriminator collision");
            self.schedule_gossip_asap(topic);
        }
    }

    /// The transport saw a foreign frame carrying our own source node-ID.
    /// The identifier is surrendered on the next update tick.
    pub fn notify_node_id_collision(&mut self) {
        if !self.node_id_collision {
            self.node_id_collision = true;
            debug!(node_id = ?self.node_id, "node-id collision reported");
        }
    }

    /// Gossip merge of one received heartbeat.
    fn ingest_heartbeat(&mut self, transfer: &Transfer) {
        let message = match Heartbeat::decode(&transfer.payload) {
            Ok(message) => message,
            Err(error) => {
                trace!(%error, "malformed heartbeat ignored");
                return;
            }
        };
        let ts = transfer.timestamp;
        let remote_hash = message.topic_hash;
        let remote_evictions = message.evictions;
        let remote_age = message.age;

        if let Some(mine) = self.directory.get(remote_hash) {
            // We carry the same topic: check for allocation consensus.
            let (my_age, my_evictions, my_subject, old_gossip) = (
                mine.age,
                mine.evictions,
                mine.subject_id(),
                mine.last_gossip,
            );
            if my_evictions != remote_evictions {
                debug!(
                    topic = %remote_hash,
                    local_subject = %my_subject,
                    local_evictions = my_evictions,
                    remote_subject = %subject_id(remote_hash, remote_evictions),
                    remote_evictions,
                    remote_uid = format_args!("{:016x}", message.uid),
                    "divergent allocation discovered via gossip"
                );
                if divergence_wins(my_age, my_evictions, remote_age, remote_evictions) {
                    // Existing allocation stands; the remote adjusts once it
                    // hears about it.
                    self.schedule_gossip_asap(remote_hash);
                } else {
                    let t = self.directory.get_mut(remote_hash).expect("present");
                    t.merge_age(remote_age);
                    self.allocate_topic(remote_hash, remote_evictions, false);
                    let t = self.directory.get_mut(remote_hash).expect("present");
                    if t.evictions == remote_evictions {
                        // Perfect sync, nothing to announce.
                        self.directory.set_gossip_time(remote_hash, old_gossip);
                    }
                    self.last_local_event_ts = ts;
                    self.directory
                        .get_mut(remote_hash)
                        .expect("present")
                        .last_local_event_ts = ts;
                }
                self.last_event_ts = ts;
                self.directory
                    .get_mut(remote_hash)
                    .expect("present")
                    .last_event_ts = ts;
            }
            self.directory
                .get_mut(remote_hash)
                .expect("present")
                .merge_age(remote_age);
        } else {
            // Unknown topic, but its claimed subject may collide with ours.
            let claimed = subject_id(remote_hash, remote_evictions);
            let Some(mine_id) = self.directory.find_by_subject(claimed) else {
                return;
            };
            let mine = self.directory.get(mine_id).expect("indexed topics exist");
            let (my_age, my_evictions) = (mine.age, mine.evictions);
            let win = collision_wins(mine_id, my_age, remote_hash, remote_age);
            debug!(
                subject = %claimed,
                local = %mine_id,
                remote = %remote_hash,
                winner = if win { "local" } else { "remote" },
                remote_uid = format_args!("{:016x}", message.uid),
                remote_node_id = %transfer.metadata.remote_node_id,
                "topic collision discovered via gossip"
            );
            if win {
                // The loser has to move, so it must learn this subject is
                // taken.
                self.schedule_gossip_asap(mine_id);
            } else {
                self.allocate_topic(mine_id, my_evictions + 1, false);
                self.last_local_event_ts = ts;
                self.directory
                    .get_mut(mine_id)
                    .expect("present")
                    .last_local_event_ts = ts;
            }
            self.last_event_ts = ts;
            self.directory
                .get_mut(mine_id)
                .expect("present")
                .last_event_ts = ts;
        }
    }

    /// Every received transfer contributes to neighbor knowledge.
    fn mark_neighbor(&mut self, remote: NodeId) {
        let value = usize::from(remote.get());
        let unassigned = self.node_id.is_none();
        let bloom = self.platform.node_id_bloom();
        // Departed nodes cannot be unmarked individually; once the filter
        // congests with tombstones it starts over.
        if bloom.popcount() > bloom.n_bits() * 31 / 32 {
            debug!(
                popcount = bloom.popcount(),
                "occupancy filter congested, purging tombstones"
            );
            bloom.purge();
        }
        let newcomer = !bloom.contains(value);
        bloom.insert(value);
        if unassigned && newcomer {
            // CSMA-style backoff: a freshly discovered neighbor postpones
            // our first claim to reduce simultaneous allocation clashes.
            let backoff = self.random_range(0, NEIGHBOR_BACKOFF_MAX as u64) as Micros;
            self.heartbeat_next += backoff;
            trace!(neighbor = %remote, backoff, "discovered neighbor while unassigned");
        }
    }

    // ---------------- scheduler ----------------

    /// Periodic driver: retires expired futures, resolves a latched node-ID
    /// collision, allocates a node-ID when due, and emits one heartbeat per
    /// period. Recommended call order within a tick: ingest first, then
    /// update, so the next heartbeat reflects just-received state.
    pub fn update(&mut self) -> Result<(), Error> {
        let now = self.platform.now();
        self.retire_expired_futures(now);

        if self.node_id_collision {
            self.node_id_collision = false;
            if self.node_id.take().is_some() {
                debug!("surrendering node-id after collision");
                self.platform.node_id_clear();
                self.heartbeat_next = now;
            }
        }

        if now < self.heartbeat_next {
            return Ok(());
        }

        // Heartbeat due with no node-ID: time to allocate one.
        if self.node_id.is_none() {
            let picked = self.pick_node_id();
            match self.platform.node_id_set(picked) {
                Ok(()) => {
                    self.node_id = Some(picked);
                    debug!(node_id = %picked, "picked own node-id");
                }
                // The whole allocation is retried on the next tick.
                Err(error) => return Err(error.into()),
            }
        }

        let gossip = self
            .directory
            .next_to_gossip()
            .expect("the heartbeat topic always exists");
        let result = self.publish_heartbeat(gossip, now);

        // Advance the phase additively (no slip), even on failure, so a
        // broken transport cannot pin one topic at the head of the queue.
        let period = (self.gossip_cycle_period_max / self.directory.len() as i64)
            .min(self.heartbeat_period_max);
        self.heartbeat_next += period;
        result
    }

    fn retire_expired_futures(&mut self, now: Micros) {
        while let Some((id, record)) = self.futures.pop_expired(now) {
            if let Some(topic) = self.directory.get_mut(record.topic) {
                topic.futures_by_transfer_id.remove(&record.transfer_id_masked);
            }
            debug!(topic = %record.topic, future = %id, "response deadline expired");
            self.events.push_back(Event::Response {
                topic: record.topic,
                future: id,
                outcome: ResponseOutcome::TimedOut,
            });
        }
    }

    fn publish_heartbeat(&mut self, gossip: TopicId, now: Micros) -> Result<(), Error> {
        let uptime_seconds = ((now - self.started_at) / 1_000_000) as u32;
        let message = {
            let topic = self
                .directory
                .get_mut(gossip)
                .expect("gossip index entries exist");
            topic.age_by_time(now);
            Heartbeat {
                uptime_seconds,
                user_word: self.user_word,
                uid: self.uid,
                topic_hash: topic.hash,
                publishing: topic.publishing,
                subscribed: topic.has_subscribers(),
                age: topic.age,
                evictions: topic.evictions,
                name: topic.name.as_bytes().to_vec(),
            }
        };
        trace!(topic = %gossip, age = message.age, evictions = message.evictions, "gossip");
        let payload = message.encode();

        let carrier_id = self.heartbeat_topic;
        let Self {
            platform,
            directory,
            ..
        } = self;
        let carrier = directory
            .get_mut(carrier_id)
            .expect("the heartbeat topic always exists");
        let params = carrier.params();
        let result = platform.topic_publish(
            &mut carrier.state,
            params,
            carrier.pub_priority,
            carrier.pub_transfer_id,
            now + HEARTBEAT_TX_TIMEOUT,
            payload,
        );
        carrier.pub_transfer_id = carrier.pub_transfer_id.wrapping_add(1);

        // A failed gossip still counts as one, otherwise a broken transport
        // would pin the same topic at the head of the queue.
        self.directory.set_gossip_time(gossip, now);
        result.map_err(Error::from)
    }

    /// Choose an unoccupied node identifier from the Bloom filter. Constant
    /// time regardless of occupancy; falls back to a random identifier only
    /// when more nodes are online than the filter has bits.
    fn pick_node_id(&mut self) -> NodeId {
        let max = usize::from(self.platform.node_id_max().get());
        let n_bits = self.platform.node_id_bloom().n_bits();
        let word_count = (max + 1).min(n_bits).div_ceil(64);
        let start_word = self.random_range(0, (word_count - 1) as u64) as usize;
        let start_bit = self.random_range(0, 63) as usize;
        let stride = self.random_range(0, (max / n_bits) as u64) as usize * n_bits;
        let fallback = self.random_range(0, max as u64) as usize;

        let bloom = self.platform.node_id_bloom();
        let mut word_index = start_word;
        for _ in 0..word_count {
            if bloom.word(word_index) != u64::MAX {
                break;
            }
            word_index = (word_index + 1) % word_count;
        }
        let word = bloom.word(word_index);
        if word == u64::MAX {
            // Every bit is taken: more nodes online than filter capacity.
            return NodeId::new(fallback as u16);
        }

        let mut bit_index = start_bit;
        while word & (1 << bit_index) != 0 {
            bit_index = (bit_index + 1) % 64;
        }
        let mut id = word_index * 64 + bit_index;

        if id > max {
            // The filter is wider than the identifier space and the free bit
            // maps past its end; scan for any free in-range identifier.
            id = (0..=max)
                .find(|&candidate| !bloom.contains(candidate))
                .unwrap_or(fallback);
        } else if id + stride <= max {
            // The filter aliases several identifiers onto each bit; a random
            // stride spreads nodes sharing a word over the whole space.
            id += stride;
        }
        bloom.insert(id);
        NodeId::new(id as u16)
    }

    // ---------------- misc ----------------

    /// Platform entropy hardened by mixing with the UID, so two nodes with a
    /// weak common entropy source still diverge.
    fn random_u64(&mut self) -> u64 {
        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&self.platform.prng().to_le_bytes());
        seed[8..].copy_from_slice(&self.uid.to_le_bytes());
        xxh3_64(&seed)
    }

    /// Uniform in `min..=max`; returns `min` when the range is empty.
    fn random_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + self.random_u64() % (max - min + 1)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;
    use crate::platform::{Priority, TransportError};
    use crate::test_utils::MockPlatform;

    fn node_with_id(seed: u64, id: u16) -> Node<MockPlatform> {
        let mut config = Config::new(0x1000 + seed);
        config.node_id = Some(id);
        Node::new(MockPlatform::new(seed), config).unwrap()
    }

    fn anonymous_node(seed: u64) -> Node<MockPlatform> {
        Node::new(MockPlatform::new(seed), Config::new(0x1000 + seed)).unwrap()
    }

    fn metadata(remote: u16, transfer_id: u64) -> TransferMetadata {
        TransferMetadata {
            priority: Priority::Nominal,
            remote_node_id: NodeId::new(remote),
            transfer_id,
        }
    }

    #[test]
    fn explicit_node_id_claims_immediately() {
        let mut node = node_with_id(1, 5);
        assert_eq!(node.node_id(), Some(NodeId::new(5)));
        assert_eq!(node.platform().installed_node_id, Some(NodeId::new(5)));

        // The first heartbeat is due on the very first tick.
        node.update().unwrap();
        let published = node.platform_mut().take_published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject_id, SubjectId::new(7509));
        let message = Heartbeat::decode(&published[0].payload).unwrap();
        assert_eq!(message.uid, node.uid());
        assert_eq!(message.name, b"7509");
    }

    #[test]
    fn autoconfigured_node_listens_before_claiming() {
        let mut node = anonymous_node(2);
        assert_eq!(node.node_id(), None);

        node.update().unwrap();
        assert_eq!(node.node_id(), None, "the start delay has not elapsed");
        assert!(node.platform().published.is_empty());

        for _ in 0..40 {
            node.platform_mut().advance(100_000);
            node.update().unwrap();
            if node.node_id().is_some() {
                break;
            }
        }
        let picked = node.node_id().expect("an id is picked within the window");
        assert!(picked.get() <= node.platform().node_id_max.get());
        assert_eq!(node.platform().installed_node_id, Some(picked));
        assert!(!node.platform().published.is_empty());
    }

    #[test]
    fn subject_hint_preseeds_the_allocation() {
        let mut node = node_with_id(3, 1);
        let topic = node
            .topic_new_with_hint("sensor/x", SubjectId::new(1000))
            .unwrap();
        let record = node.topic(topic).unwrap();
        assert_eq!(record.subject_id(), SubjectId::new(1000));
        // A hinted start is not an allocation conflict.
        assert_eq!(record.last_local_event_ts(), 0);
    }

    #[test]
    fn pinned_topic_evicts_a_dynamic_squatter() {
        let mut node = node_with_id(4, 1);
        let squatter = node
            .topic_new_with_hint("telemetry/imu", SubjectId::new(100))
            .unwrap();
        assert_eq!(
            node.topic(squatter).unwrap().subject_id(),
            SubjectId::new(100)
        );

        let pinned = node.topic_new("/100").unwrap();
        assert_eq!(node.topic(pinned).unwrap().subject_id(), SubjectId::new(100));
        assert_eq!(
            node.topic(squatter).unwrap().subject_id(),
            SubjectId::new(101),
            "the loser shifts by one slot"
        );
    }

    #[test]
    fn evictions_chain_through_adjacent_slots() {
        let mut node = node_with_id(5, 1);
        let a = node
            .topic_new_with_hint("chain/a", SubjectId::new(2000))
            .unwrap();
        let b = node
            .topic_new_with_hint("chain/b", SubjectId::new(2001))
            .unwrap();
        let pinned = node.topic_new("/2000").unwrap();

        let mut subjects: Vec<u16> = [a, b, pinned]
            .iter()
            .map(|&id| node.topic(id).unwrap().subject_id().get())
            .collect();
        subjects.sort_unstable();
        assert_eq!(subjects, vec![2000, 2001, 2002]);
        assert_eq!(node.topic(pinned).unwrap().subject_id().get(), 2000);
    }

    #[test]
    fn widening_a_subscription_recreates_the_transport_subscription() {
        let mut node = node_with_id(6, 1);
        let topic = node.topic_new("wide").unwrap();
        node.subscribe(
            topic,
            SubscriptionParams {
                extent: 16,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(node.topic(topic).unwrap().state().subscribe_calls, 1);

        node.subscribe(
            topic,
            SubscriptionParams {
                extent: 64,
                ..Default::default()
            },
        )
        .unwrap();
        let state = node.topic(topic).unwrap().state();
        assert_eq!(state.unsubscribe_calls, 1);
        assert_eq!(state.subscribe_calls, 2);
        assert_eq!(state.last_params.unwrap().extent, 64);

        // A narrower subscriber changes nothing.
        node.subscribe(
            topic,
            SubscriptionParams {
                extent: 32,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(node.topic(topic).unwrap().state().subscribe_calls, 2);
    }

    #[test]
    fn failed_subscribe_is_reported_and_retried_on_reallocation() {
        let mut node = node_with_id(7, 1);
        let topic = node
            .topic_new_with_hint("fragile", SubjectId::new(300))
            .unwrap();

        node.platform_mut().fail_subscribe = true;
        let sub = node.subscribe(topic, SubscriptionParams::default()).unwrap();
        assert_matches!(
            node.next_event(),
            Some(Event::SubscriptionError { topic: t, .. }) if t == topic
        );
        assert!(!node.topic(topic).unwrap().subscribed());
        let _ = sub;

        // The next allocation event retries the subscription.
        node.platform_mut().fail_subscribe = false;
        node.topic_new("/300").unwrap(); // evicts `fragile` to subject 301
        assert_eq!(node.topic(topic).unwrap().subject_id(), SubjectId::new(301));
        assert!(node.topic(topic).unwrap().subscribed());
    }

    #[test]
    fn anonymous_publication_is_rejected_where_required() {
        let mut node = anonymous_node(8);
        let topic = node.topic_new("data").unwrap();
        assert_matches!(
            node.publish(topic, 1_000, Bytes::from_static(b"x")),
            Err(Error::Anonymous)
        );

        node.platform_mut().requires_node_id = false;
        node.publish(topic, 1_000, Bytes::from_static(b"x")).unwrap();
        assert_eq!(node.platform().published.len(), 1);
    }

    #[test]
    fn sample_delivery_and_payload_retention() {
        let mut node = node_with_id(9, 1);
        let topic = node.topic_new("stream").unwrap();

        // Without subscribers the payload is dropped, but the transfer still
        // ages the topic and marks the sender.
        node.ingest_topic_transfer(
            topic,
            Transfer {
                timestamp: 10,
                metadata: metadata(30, 1),
                payload: Bytes::from_static(b"ignored"),
            },
        );
        assert!(node.next_event().is_none());
        assert_eq!(node.topic(topic).unwrap().age(), 1);
        assert!(node.topic(topic).unwrap().last_sample().is_none());
        assert!(node.platform_mut().bloom.contains(30));

        let sub = node.subscribe(topic, SubscriptionParams::default()).unwrap();
        node.ingest_topic_transfer(
            topic,
            Transfer {
                timestamp: 20,
                metadata: metadata(30, 2),
                payload: Bytes::from_static(b"sample"),
            },
        );
        assert_matches!(
            node.next_event(),
            Some(Event::Sample { topic: t, subscription }) if t == topic && subscription == sub
        );
        assert_eq!(
            node.topic(topic).unwrap().last_sample().unwrap().payload.as_ref(),
            b"sample"
        );
    }

    #[test]
    fn transfer_id_window_exhaustion_is_capacity() {
        let mut node = node_with_id(10, 1);
        node.platform_mut().transfer_id_mask = 31;
        let topic = node.topic_new("query").unwrap();

        node.publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000_000)
            .unwrap();
        for _ in 0..31 {
            node.publish(topic, 1_000, Bytes::from_static(b"q")).unwrap();
        }
        // The window wrapped onto the still-pending future.
        assert_matches!(
            node.publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000_000),
            Err(Error::TransferIdExhausted)
        );
    }

    #[test]
    fn future_timeout_then_late_response_is_dropped() {
        let mut node = node_with_id(11, 1);
        let topic = node.topic_new("query").unwrap();
        let future = node
            .publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000)
            .unwrap();
        let transfer_id = node.platform().published[0].transfer_id;

        node.platform_mut().advance(2_000);
        node.update().unwrap();
        assert_matches!(
            node.next_event(),
            Some(Event::Response { future: f, outcome: ResponseOutcome::TimedOut, .. }) if f == future
        );

        // The reply shows up after the deadline: silently dropped.
        let hash = node.topic(topic).unwrap().id().get();
        let mut payload = hash.to_le_bytes().to_vec();
        payload.extend_from_slice(b"late");
        node.ingest_response_transfer(Transfer {
            timestamp: node.platform().now,
            metadata: metadata(40, transfer_id),
            payload: Bytes::from(payload),
        });
        assert!(node.next_event().is_none());
    }

    #[test]
    fn failed_publication_rolls_the_future_back() {
        let mut node = node_with_id(12, 1);
        let topic = node.topic_new("query").unwrap();

        node.platform_mut().fail_publish = true;
        let before = node.topic(topic).unwrap().pub_transfer_id;
        assert_matches!(
            node.publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000_000),
            Err(Error::Transport(TransportError(-5)))
        );
        // The transfer-id is consumed regardless; the gap is informative.
        assert_eq!(node.topic(topic).unwrap().pub_transfer_id, before.wrapping_add(1));

        // No future is left behind to match a stray reply.
        let hash = node.topic(topic).unwrap().id().get();
        let mut payload = hash.to_le_bytes().to_vec();
        payload.extend_from_slice(b"stray");
        node.ingest_response_transfer(Transfer {
            timestamp: 0,
            metadata: metadata(40, before),
            payload: Bytes::from(payload),
        });
        assert!(node.next_event().is_none());
    }

    #[test]
    fn cancelled_futures_never_fire() {
        let mut node = node_with_id(13, 1);
        let topic = node.topic_new("query").unwrap();
        let future = node
            .publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000)
            .unwrap();
        assert!(node.cancel_response(future));
        assert!(!node.cancel_response(future));

        node.platform_mut().advance(10_000);
        node.update().unwrap();
        assert!(node.next_event().is_none());
    }

    #[test]
    fn respond_frames_the_topic_hash() {
        let mut node = node_with_id(14, 1);
        let topic = node.topic_new("query").unwrap();
        node.respond(topic, 5_000, metadata(9, 7), b"reply").unwrap();

        let requests = node.platform_mut().take_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].service_id, RESPONSE_SERVICE_ID);
        assert_eq!(requests[0].metadata.transfer_id, 7);
        assert_eq!(requests[0].metadata.remote_node_id, NodeId::new(9));
        let hash = node.topic(topic).unwrap().id().get();
        assert_eq!(&requests[0].payload[..8], &hash.to_le_bytes());
        assert_eq!(&requests[0].payload[8..], b"reply");
    }

    #[test]
    fn destroy_releases_every_index_and_future() {
        let mut node = node_with_id(15, 1);
        let topic = node.topic_new("doomed").unwrap();
        let subject = node.topic(topic).unwrap().subject_id();
        node.subscribe(topic, SubscriptionParams::default()).unwrap();
        let future = node
            .publish_with_response(topic, 1_000, Bytes::from_static(b"q"), 1_000)
            .unwrap();

        node.topic_destroy(topic).unwrap();
        assert!(node.topic(topic).is_none());
        assert_eq!(node.find_by_subject_id(subject), None);
        assert!(!node.cancel_response(future));

        // No timeout fires for the cancelled future.
        node.platform_mut().advance(10_000);
        node.update().unwrap();
        assert!(node.next_event().is_none());
        assert_matches!(node.topic_destroy(topic), Err(Error::UnknownTopic));
    }

    #[test]
    fn the_heartbeat_topic_cannot_be_destroyed() {
        let mut node = node_with_id(16, 1);
        let heartbeat = node.heartbeat_topic();
        assert_matches!(
            node.topic_destroy(heartbeat),
            Err(Error::HeartbeatTopicProtected)
        );
    }

    #[test]
    fn gossip_rotates_through_all_topics() {
        let mut node = node_with_id(17, 1);
        node.topic_new("rot/a").unwrap();
        node.topic_new("rot/b").unwrap();

        for _ in 0..40 {
            node.platform_mut().advance(100_000);
            node.update().unwrap();
        }
        let gossiped: std::collections::BTreeSet<u64> = node
            .platform_mut()
            .take_published()
            .iter()
            .map(|p| Heartbeat::decode(&p.payload).unwrap().topic_hash.get())
            .collect();
        assert_eq!(gossiped.len(), 3, "every topic is announced in a cycle");
    }

    #[test]
    fn node_id_collision_restarts_allocation() {
        let mut node = node_with_id(18, 5);
        node.notify_node_id_collision();
        node.platform_mut().advance(50_000);
        node.update().unwrap();

        let reallocated = node.node_id().expect("a fresh id is picked immediately");
        assert_ne!(reallocated, NodeId::new(5), "the contested id is occupied");
        assert_eq!(node.platform().installed_node_id, Some(reallocated));
    }

    #[test]
    fn ready_after_a_quiet_gossip_cycle() {
        let mut node = node_with_id(19, 1);
        node.platform_mut().advance(5_000_000);
        let topic = node.topic_new("settling").unwrap();
        assert_eq!(node.topic(topic).unwrap().last_event_ts(), 5_000_000);
        assert!(!node.ready());

        node.platform_mut().advance(9_000_000);
        assert!(!node.ready(), "one cycle has not passed since the event");
        node.platform_mut().advance(1_000_000);
        assert!(node.ready());
    }

    #[test]
    fn names_resolve_back_to_topics() {
        let mut node = node_with_id(20, 1);
        let topic = node.topic_new("lookup//x/").unwrap();
        assert_eq!(node.find_by_name("lookup/x"), Some(topic));
        assert_eq!(node.find_by_name("/lookup/x"), Some(topic));
        assert_eq!(node.find_by_name("lookup/y"), None);
        assert_matches!(node.topic_new("lookup/x"), Err(Error::NameTaken));
    }
}
