// SPDX-License-Identifier: MIT OR Apache-2.0

//! The platform interface: everything the core needs from the transport and
//! the execution environment, expressed as a single trait.
//!
//! The core is sans-IO. It never opens sockets, never sleeps and never spawns
//! threads; it calls into the [`Platform`] for time, randomness and transfer
//! transmission, and the caller feeds received transfers back through the
//! `ingest_*` entrypoints of [`crate::Node`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bloom::Bloom64;
use crate::name::SubjectId;

/// Monotonic timestamp or duration in microseconds.
pub type Micros = i64;

/// The RPC service identifier carrying topic responses.
pub const RESPONSE_SERVICE_ID: u16 = 510;

/// Node identifier on the bus. The valid range is transport-specific
/// (`0..=node_id_max`), e.g. `0..=127` on CAN.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u16);

impl NodeId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Transfer priority, highest first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    #[default]
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

/// Per-transfer addressing information delivered by (and handed back to) the
/// transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferMetadata {
    pub priority: Priority,
    pub remote_node_id: NodeId,
    pub transfer_id: u64,
}

/// A reassembled inbound transfer. The payload is owned; dropping the
/// transfer releases it.
#[derive(Clone, Debug)]
pub struct Transfer {
    /// Reception timestamp.
    pub timestamp: Micros,
    pub metadata: TransferMetadata,
    pub payload: Bytes,
}

/// Snapshot of the topic attributes the transport needs to maintain its
/// receive and transmit paths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopicParams {
    pub subject_id: SubjectId,
    /// High bits of the topic hash, for frame-level rejection of transfers
    /// from divergent topics squatting on the same subject identifier.
    pub discriminator: u64,
    /// Largest payload extent requested by any local subscriber.
    pub extent: usize,
    /// Largest transfer-id timeout requested by any local subscriber.
    pub transfer_id_timeout: Micros,
}

/// A negative status code returned by the transport, preserved verbatim.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transport error {0}")]
pub struct TransportError(pub i32);

/// Services the core consumes. One implementation per transport.
///
/// All operations are infallible unless documented otherwise; fallible ones
/// report transport-specific negative codes through [`TransportError`].
pub trait Platform {
    /// Transport-specific extension of a topic (sessions, socket state, …).
    /// Created by [`Platform::topic_new`] and carried inside every
    /// [`crate::Topic`].
    type TopicState;

    /// Monotonic time in microseconds. Non-negative at boot and strictly
    /// non-decreasing.
    fn now(&mut self) -> Micros;

    /// 64-bit pseudo-random value. Need not be of cryptographic quality, but
    /// must differ across quick reboots. The core additionally hashes the
    /// returned value with the local UID.
    fn prng(&mut self) -> u64;

    /// Largest valid node identifier on this transport.
    fn node_id_max(&self) -> NodeId;

    /// Bit mask of the transport's cyclic transfer-id width (one less than a
    /// power of two). Transports with a 64-bit linear transfer-id use the
    /// all-ones mask.
    fn transfer_id_mask(&self) -> u64;

    /// Whether publications require a local node identifier. Transports that
    /// support anonymous transfers return false.
    fn requires_node_id(&self) -> bool {
        true
    }

    /// The node identifier occupancy set. Owned by the platform, borrowed by
    /// the core whenever it records a neighbor or allocates an identifier.
    /// The bit count must be a positive multiple of 64 and stable over the
    /// lifetime of the platform.
    fn node_id_bloom(&mut self) -> &mut Bloom64;

    /// Install the local node identifier in the transport.
    fn node_id_set(&mut self, node_id: NodeId) -> Result<(), TransportError>;

    /// Remove the local node identifier. Infallible.
    fn node_id_clear(&mut self);

    /// Send one RPC request transfer addressed per `metadata`.
    fn request(
        &mut self,
        service_id: u16,
        metadata: TransferMetadata,
        deadline: Micros,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Allocate transport state for a new topic.
    fn topic_new(&mut self) -> Result<Self::TopicState, TransportError>;

    /// Release transport state of a destroyed topic.
    fn topic_destroy(&mut self, state: Self::TopicState);

    /// Emit one transfer on the topic's subject. The transfer-id is managed
    /// by the core.
    fn topic_publish(
        &mut self,
        state: &mut Self::TopicState,
        params: TopicParams,
        priority: Priority,
        transfer_id: u64,
        deadline: Micros,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Activate the receive path at the topic's current subject identifier.
    fn topic_subscribe(
        &mut self,
        state: &mut Self::TopicState,
        params: TopicParams,
    ) -> Result<(), TransportError>;

    /// Deactivate the receive path. Infallible.
    fn topic_unsubscribe(&mut self, state: &mut Self::TopicState, params: TopicParams);
}
