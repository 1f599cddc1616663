// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracking of expected responses to outgoing publications.
//!
//! A future lives in two indices while pending: its topic's map keyed by the
//! masked transfer-id (so an inbound reply can be matched) and the global set
//! keyed by deadline (so expiry is a min-lookup). Completion, timeout and
//! cancellation all remove it from both before the caller can observe it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::name::TopicId;
use crate::platform::Micros;

/// Handle of a pending response future.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FutureId(pub(crate) u64);

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct ResponseFuture {
    pub(crate) topic: TopicId,
    pub(crate) transfer_id_masked: u64,
    pub(crate) deadline: Micros,
}

/// All pending futures of a node.
#[derive(Debug, Default)]
pub(crate) struct FutureTable {
    records: HashMap<FutureId, ResponseFuture>,
    /// Deadline index; only futures whose publication actually went out are
    /// armed here.
    by_deadline: BTreeSet<(Micros, FutureId)>,
    next_id: u64,
}

impl FutureTable {
    /// Register a future. It is not armed for expiry yet; see
    /// [`Self::arm`].
    pub(crate) fn allocate(
        &mut self,
        topic: TopicId,
        transfer_id_masked: u64,
        deadline: Micros,
    ) -> FutureId {
        let id = FutureId(self.next_id);
        self.next_id += 1;
        self.records.insert(
            id,
            ResponseFuture {
                topic,
                transfer_id_masked,
                deadline,
            },
        );
        id
    }

    /// Enter the future into the deadline index once its publication
    /// succeeded.
    pub(crate) fn arm(&mut self, id: FutureId) {
        if let Some(record) = self.records.get(&id) {
            self.by_deadline.insert((record.deadline, id));
        }
    }

    /// Drop a future, armed or not. Returns its record so the caller can
    /// also clear the per-topic index.
    pub(crate) fn remove(&mut self, id: FutureId) -> Option<ResponseFuture> {
        let record = self.records.remove(&id)?;
        self.by_deadline.remove(&(record.deadline, id));
        Some(record)
    }

    /// Remove and return the earliest-armed future whose deadline has
    /// passed, if any.
    pub(crate) fn pop_expired(&mut self, now: Micros) -> Option<(FutureId, ResponseFuture)> {
        let &(deadline, id) = self.by_deadline.first()?;
        if deadline >= now {
            return None;
        }
        self.by_deadline.remove(&(deadline, id));
        let record = self
            .records
            .remove(&id)
            .expect("armed futures always have a record");
        Some((id, record))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
