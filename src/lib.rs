// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decentralised topic naming and addressing for peer-to-peer pub/sub buses.
//!
//! A fleet of nodes agrees, without any central coordinator, on a unique
//! small-integer node identifier per peer and a unique subject identifier
//! per human-readable topic name. Both mappings are repaired by gossip
//! carried on a single pinned heartbeat topic and converge through a
//! conflict-free replicated data type: every replica applies the same
//! deterministic arbitration to the observations it receives.
//!
//! The crate is sans-IO and single-threaded. It consumes a [`Platform`]
//! (time, randomness, and a transport to publish, subscribe and request
//! through) and exposes a [`Node`] the caller drives from its own event
//! loop: feed received transfers through the `ingest_*` entrypoints, call
//! [`Node::update`] periodically, and drain [`Node::next_event`].

pub mod bloom;
pub mod config;
mod directory;
mod error;
mod event;
mod future;
pub mod heartbeat;
pub mod name;
mod node;
mod platform;
#[cfg(feature = "test_utils")]
pub mod test_utils;
mod topic;

pub use bloom::Bloom64;
pub use config::Config;
pub use error::Error;
pub use event::{Event, ResponseOutcome};
pub use future::FutureId;
pub use name::{NameError, SubjectId, TopicId};
pub use node::Node;
pub use platform::{
    Micros, NodeId, Platform, Priority, RESPONSE_SERVICE_ID, TopicParams, Transfer,
    TransferMetadata, TransportError,
};
pub use topic::{SubscriptionId, SubscriptionParams, Topic};
