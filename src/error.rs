// SPDX-License-Identifier: MIT OR Apache-2.0

use thiserror::Error;

use crate::name::{NameError, TOPIC_SUBJECT_COUNT};
use crate::platform::TransportError;

/// Errors returned by [`crate::Node`] operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The UID must not be zero.
    #[error("uid must not be zero")]
    ZeroUid,

    /// An explicitly configured node identifier exceeds the transport limit.
    #[error("node-id {0:04x} exceeds the transport maximum {1:04x}")]
    NodeIdOutOfRange(u16, u16),

    /// The topic name did not survive canonicalization.
    #[error(transparent)]
    Name(#[from] NameError),

    /// Another local topic already uses this name (same hash).
    #[error("topic name is already in use")]
    NameTaken,

    /// All subject identifiers are taken.
    #[error("cannot allocate more than {TOPIC_SUBJECT_COUNT} topics")]
    TopicCapacity,

    /// The masked transfer-id window of this topic has a pending response
    /// future at the same position.
    #[error("transfer-id window exhausted, a response future is still pending")]
    TransferIdExhausted,

    /// The referenced topic does not exist on this node.
    #[error("unknown topic")]
    UnknownTopic,

    /// The heartbeat topic cannot be destroyed while the node is alive.
    #[error("the heartbeat topic cannot be destroyed")]
    HeartbeatTopicProtected,

    /// Publication attempted without a local node identifier on a transport
    /// that requires one.
    #[error("no local node-id is assigned yet")]
    Anonymous,

    /// The platform returned a negative status code, preserved verbatim.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
