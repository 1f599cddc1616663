// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events queued by the core for the caller to drain via
//! [`crate::Node::next_event`].
//!
//! Events are queued at exactly the points where work for the application
//! arises (a sample delivered, a response resolved, a re-subscription
//! failed), so draining them between core calls observes the same order a
//! callback-based dispatch would.

use crate::future::FutureId;
use crate::name::TopicId;
use crate::platform::{Transfer, TransportError};
use crate::topic::SubscriptionId;

#[derive(Debug)]
pub enum Event {
    /// A transfer arrived on a subscribed topic. The payload is held in the
    /// topic's [`crate::Topic::last_sample`] slot until the next arrival
    /// replaces it. One event is queued per live subscription.
    Sample {
        topic: TopicId,
        subscription: SubscriptionId,
    },

    /// A response future resolved, successfully or by timeout. The future no
    /// longer exists by the time the event is observed.
    Response {
        topic: TopicId,
        future: FutureId,
        outcome: ResponseOutcome,
    },

    /// Re-activating the transport subscription after an allocation change
    /// (or activating it on first subscribe) failed. The receive path stays
    /// down until the next allocation event retries it.
    SubscriptionError {
        topic: TopicId,
        error: TransportError,
    },
}

#[derive(Debug)]
pub enum ResponseOutcome {
    /// The reply arrived; the topic-hash prefix has been stripped.
    Arrived(Transfer),

    /// The response deadline elapsed.
    TimedOut,
}
