// SPDX-License-Identifier: MIT OR Apache-2.0

//! Node configuration.

use serde::{Deserialize, Serialize};

use crate::platform::Micros;

/// Default upper bound on the interval between two heartbeats.
pub const DEFAULT_HEARTBEAT_PERIOD_MAX: Micros = 100_000;

/// Default upper bound on the time it takes to gossip every local topic once.
pub const DEFAULT_GOSSIP_CYCLE_PERIOD_MAX: Micros = 10_000_000;

/// Default name of the pinned topic all gossip is carried on.
pub const DEFAULT_HEARTBEAT_TOPIC: &str = "/7509";

/// Configuration of a [`crate::Node`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Globally unique 64-bit identifier of this node. Must not be zero.
    pub uid: u64,

    /// Explicitly assigned node identifier. When absent, the node listens to
    /// the network and picks an unoccupied identifier on its own; explicit
    /// assignments take precedence over autoconfigured ones in collisions.
    pub node_id: Option<u16>,

    /// Namespace prefix for relative topic names. Up to 94 bytes.
    pub namespace: String,

    /// Name prefix for `~`-rooted topic names. Up to 94 bytes; derived from
    /// the UID when absent.
    pub node_name: Option<String>,

    /// Upper bound on the interval between two heartbeats.
    pub heartbeat_period_max: Micros,

    /// Upper bound on the duration of one full gossip cycle. The effective
    /// heartbeat period is `min(heartbeat_period_max, this / topic_count)`.
    pub gossip_cycle_period_max: Micros,

    /// Name of the pinned heartbeat topic.
    pub heartbeat_topic: String,

    /// Opaque 24 bits published in every heartbeat.
    pub user_word: [u8; 3],
}

impl Config {
    pub fn new(uid: u64) -> Self {
        Self {
            uid,
            node_id: None,
            namespace: "/".to_owned(),
            node_name: None,
            heartbeat_period_max: DEFAULT_HEARTBEAT_PERIOD_MAX,
            gossip_cycle_period_max: DEFAULT_GOSSIP_CYCLE_PERIOD_MAX,
            heartbeat_topic: DEFAULT_HEARTBEAT_TOPIC.to_owned(),
            user_word: [0; 3],
        }
    }
}
