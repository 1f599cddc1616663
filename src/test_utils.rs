// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scripted in-memory platform for tests: deterministic clock and PRNG,
//! recorded outbound traffic, and injectable transport failures.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::bloom::Bloom64;
use crate::name::SubjectId;
use crate::platform::{
    Micros, NodeId, Platform, Priority, TopicParams, TransferMetadata, TransportError,
};

/// A transfer the core asked the mock transport to publish.
#[derive(Clone, Debug)]
pub struct PublishedTransfer {
    pub subject_id: SubjectId,
    pub discriminator: u64,
    pub priority: Priority,
    pub transfer_id: u64,
    pub deadline: Micros,
    pub payload: Bytes,
}

/// An RPC request the core asked the mock transport to send.
#[derive(Clone, Debug)]
pub struct SentRequest {
    pub service_id: u16,
    pub metadata: TransferMetadata,
    pub deadline: Micros,
    pub payload: Bytes,
}

/// Per-topic transport state of the mock.
#[derive(Clone, Debug, Default)]
pub struct MockTopicState {
    pub ordinal: u64,
    pub subscribe_calls: u32,
    pub unsubscribe_calls: u32,
    /// Parameters of the most recent (un)subscribe call.
    pub last_params: Option<TopicParams>,
}

/// Deterministic [`Platform`] implementation.
pub struct MockPlatform {
    pub now: Micros,
    pub rng: StdRng,
    pub bloom: Bloom64,
    pub node_id_max: NodeId,
    pub transfer_id_mask: u64,
    pub requires_node_id: bool,
    /// What the mock transport believes the local node-ID is.
    pub installed_node_id: Option<NodeId>,
    pub published: Vec<PublishedTransfer>,
    pub requests: Vec<SentRequest>,
    pub fail_subscribe: bool,
    pub fail_publish: bool,
    pub fail_node_id_set: bool,
    next_topic_ordinal: u64,
}

impl MockPlatform {
    pub fn new(seed: u64) -> Self {
        Self {
            now: 0,
            rng: StdRng::seed_from_u64(seed),
            bloom: Bloom64::new(128),
            node_id_max: NodeId::new(127),
            transfer_id_mask: u64::MAX,
            requires_node_id: true,
            installed_node_id: None,
            published: Vec::new(),
            requests: Vec::new(),
            fail_subscribe: false,
            fail_publish: false,
            fail_node_id_set: false,
            next_topic_ordinal: 0,
        }
    }

    pub fn advance(&mut self, micros: Micros) {
        self.now += micros;
    }

    /// Drain the record of published transfers.
    pub fn take_published(&mut self) -> Vec<PublishedTransfer> {
        std::mem::take(&mut self.published)
    }

    /// Drain the record of sent RPC requests.
    pub fn take_requests(&mut self) -> Vec<SentRequest> {
        std::mem::take(&mut self.requests)
    }
}

impl Platform for MockPlatform {
    type TopicState = MockTopicState;

    fn now(&mut self) -> Micros {
        self.now
    }

    fn prng(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn node_id_max(&self) -> NodeId {
        self.node_id_max
    }

    fn transfer_id_mask(&self) -> u64 {
        self.transfer_id_mask
    }

    fn requires_node_id(&self) -> bool {
        self.requires_node_id
    }

    fn node_id_bloom(&mut self) -> &mut Bloom64 {
        &mut self.bloom
    }

    fn node_id_set(&mut self, node_id: NodeId) -> Result<(), TransportError> {
        if self.fail_node_id_set {
            return Err(TransportError(-1));
        }
        self.installed_node_id = Some(node_id);
        Ok(())
    }

    fn node_id_clear(&mut self) {
        self.installed_node_id = None;
    }

    fn request(
        &mut self,
        service_id: u16,
        metadata: TransferMetadata,
        deadline: Micros,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.requests.push(SentRequest {
            service_id,
            metadata,
            deadline,
            payload,
        });
        Ok(())
    }

    fn topic_new(&mut self) -> Result<Self::TopicState, TransportError> {
        let ordinal = self.next_topic_ordinal;
        self.next_topic_ordinal += 1;
        Ok(MockTopicState {
            ordinal,
            ..Default::default()
        })
    }

    fn topic_destroy(&mut self, _state: Self::TopicState) {}

    fn topic_publish(
        &mut self,
        _state: &mut Self::TopicState,
        params: TopicParams,
        priority: Priority,
        transfer_id: u64,
        deadline: Micros,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if self.fail_publish {
            return Err(TransportError(-5));
        }
        self.published.push(PublishedTransfer {
            subject_id: params.subject_id,
            discriminator: params.discriminator,
            priority,
            transfer_id,
            deadline,
            payload,
        });
        Ok(())
    }

    fn topic_subscribe(
        &mut self,
        state: &mut Self::TopicState,
        params: TopicParams,
    ) -> Result<(), TransportError> {
        if self.fail_subscribe {
            return Err(TransportError(-7));
        }
        state.subscribe_calls += 1;
        state.last_params = Some(params);
        Ok(())
    }

    fn topic_unsubscribe(&mut self, state: &mut Self::TopicState, params: TopicParams) {
        state.unsubscribe_calls += 1;
        state.last_params = Some(params);
    }
}
