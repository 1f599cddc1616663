// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire codec for the heartbeat message that carries all gossip.
//!
//! The layout is fixed and little-endian, 40 header bytes followed by the
//! topic name, truncated after the actual name length:
//!
//! ```text
//! offset  size  field
//!  0      4     uptime_seconds
//!  4      3     user_word (opaque)
//!  7      1     version (must be 1)
//!  8      8     uid
//! 16      8     topic_hash
//! 24      8     flags8 | age56
//! 32      8     name_len8 | reserved16 | evictions40
//! 40      0..96 topic_name_bytes
//! ```

use bytes::Bytes;
use thiserror::Error;

use crate::name::{TOPIC_NAME_MAX, TopicId};

/// Layout version understood by this implementation.
pub const HEARTBEAT_VERSION: u8 = 1;

/// Size of the fixed part of the message.
pub const HEARTBEAT_HEADER_SIZE: usize = 40;

/// Largest possible heartbeat message.
pub const HEARTBEAT_SIZE_MAX: usize = HEARTBEAT_HEADER_SIZE + TOPIC_NAME_MAX;

const FLAG_PUBLISHING: u8 = 1;
const FLAG_SUBSCRIBED: u8 = 2;

const AGE_MASK: u64 = (1 << 56) - 1;
const EVICTIONS_MASK: u64 = (1 << 40) - 1;

/// One gossip announcement: the sender's identity plus a single topic's
/// current allocation state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub uptime_seconds: u32,
    /// Opaque 24 bits at the application's disposal.
    pub user_word: [u8; 3],
    pub uid: u64,
    pub topic_hash: TopicId,
    /// Whether the sender publishes on the topic locally.
    pub publishing: bool,
    /// Whether the sender subscribes to the topic locally.
    pub subscribed: bool,
    /// Topic age, 56 bits on the wire.
    pub age: u64,
    /// Topic eviction counter, 40 bits on the wire.
    pub evictions: u64,
    /// Canonical topic name as raw bytes; diagnostic only.
    pub name: Vec<u8>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("heartbeat of {0} bytes is shorter than the {HEARTBEAT_HEADER_SIZE}-byte header")]
    TooShort(usize),

    #[error("unsupported heartbeat version {0}")]
    UnsupportedVersion(u8),

    #[error("topic name length {0} exceeds the message or the {TOPIC_NAME_MAX}-byte limit")]
    BadNameLength(usize),
}

impl Heartbeat {
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.name.len() <= TOPIC_NAME_MAX);
        let flags = u64::from(self.publishing) * u64::from(FLAG_PUBLISHING)
            | u64::from(self.subscribed) * u64::from(FLAG_SUBSCRIBED);
        let mut buf = Vec::with_capacity(HEARTBEAT_HEADER_SIZE + self.name.len());
        buf.extend_from_slice(&self.uptime_seconds.to_le_bytes());
        buf.extend_from_slice(&self.user_word);
        buf.push(HEARTBEAT_VERSION);
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.topic_hash.get().to_le_bytes());
        buf.extend_from_slice(&((flags << 56) | (self.age & AGE_MASK)).to_le_bytes());
        buf.extend_from_slice(
            &(((self.name.len() as u64) << 56) | (self.evictions & EVICTIONS_MASK)).to_le_bytes(),
        );
        buf.extend_from_slice(&self.name);
        Bytes::from(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HeartbeatError> {
        if buf.len() < HEARTBEAT_HEADER_SIZE {
            return Err(HeartbeatError::TooShort(buf.len()));
        }
        let version = buf[7];
        if version != HEARTBEAT_VERSION {
            return Err(HeartbeatError::UnsupportedVersion(version));
        }
        let word_at = |offset: usize| {
            u64::from_le_bytes(buf[offset..offset + 8].try_into().expect("8-byte slice"))
        };
        let flags_age = word_at(24);
        let len_evictions = word_at(32);
        let flags = (flags_age >> 56) as u8;
        let name_len = (len_evictions >> 56) as usize;
        if name_len > TOPIC_NAME_MAX || name_len > buf.len() - HEARTBEAT_HEADER_SIZE {
            return Err(HeartbeatError::BadNameLength(name_len));
        }
        Ok(Self {
            uptime_seconds: u32::from_le_bytes(buf[0..4].try_into().expect("4-byte slice")),
            user_word: [buf[4], buf[5], buf[6]],
            uid: word_at(8),
            topic_hash: TopicId::new(word_at(16)),
            publishing: flags & FLAG_PUBLISHING != 0,
            subscribed: flags & FLAG_SUBSCRIBED != 0,
            age: flags_age & AGE_MASK,
            evictions: len_evictions & EVICTIONS_MASK,
            name: buf[HEARTBEAT_HEADER_SIZE..HEARTBEAT_HEADER_SIZE + name_len].to_vec(),
        })
    }

    /// The topic name for log output.
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}
