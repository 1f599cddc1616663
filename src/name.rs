// SPDX-License-Identifier: MIT OR Apache-2.0

//! Topic name canonicalization, pinned-name detection and hashing.
//!
//! Every topic is identified by the 64-bit hash of its canonical name. Names
//! which are plain decimal numbers below 8192 are "pinned": their hash is the
//! number itself, which places them directly at that subject identifier and
//! exempts them from re-allocation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Maximum length of a canonical topic name in bytes.
pub const TOPIC_NAME_MAX: usize = 96;

/// Maximum length of the namespace and node name strings in bytes.
pub const NAMESPACE_NAME_MAX: usize = 94;

/// Number of subject identifiers available for dynamic allocation.
pub const TOPIC_SUBJECT_COUNT: u16 = 6144;

/// Total size of the subject identifier space, including the pinned-only
/// range above [`TOPIC_SUBJECT_COUNT`].
pub const TOTAL_SUBJECT_COUNT: u16 = 8192;

/// Stable identifier of a topic: the 64-bit hash of its canonical name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopicId(u64);

impl TopicId {
    pub const fn new(hash: u64) -> Self {
        Self(hash)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Pinned topics occupy the subject identifier equal to their hash and
    /// never move. A uniformly random hash lands in the pinned range with
    /// probability ~4.4e-16.
    pub const fn is_pinned(self) -> bool {
        self.0 < TOTAL_SUBJECT_COUNT as u64
    }

    /// The 51 high bits of the hash, published with every transport frame so
    /// the transport can drop frames whose subject identifier has been taken
    /// over by a divergent topic.
    pub const fn discriminator(self) -> u64 {
        self.0 >> 13
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:016x}", self.0)
    }
}

/// Subject identifier: the small-integer address a topic publishes on.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubjectId(u16);

impl SubjectId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:04x}", self.0)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NameError {
    /// The canonical form of the name is empty.
    #[error("canonical topic name is empty")]
    Empty,

    /// The canonical form exceeds [`TOPIC_NAME_MAX`] bytes.
    #[error("canonical topic name is {0} bytes long, the limit is {TOPIC_NAME_MAX}")]
    TooLong(usize),

    /// A namespace or node name exceeds [`NAMESPACE_NAME_MAX`] bytes.
    #[error("namespace or node name is {0} bytes long, the limit is {NAMESPACE_NAME_MAX}")]
    PrefixTooLong(usize),
}

/// Resolve a user-supplied topic name against the namespace and node name,
/// then canonicalize it.
///
/// Names starting with `/` are absolute. Names starting with `~` (or resolved
/// under a `~` namespace) are rooted at the node name; everything else is
/// rooted at the namespace. Runs of `/` collapse into one, leading and a
/// single trailing `/` are stripped, so a canonical name never starts or ends
/// with a separator. All other byte values pass through verbatim.
pub fn canonicalize(namespace: &str, node_name: &str, name: &str) -> Result<String, NameError> {
    let expanded = if name.starts_with('/') {
        name.to_owned()
    } else {
        let under_node = name.starts_with('~') || namespace.starts_with('~');
        let rest = name.strip_prefix('~').unwrap_or(name);
        let prefix = if under_node { node_name } else { namespace };
        format!("{prefix}/{rest}")
    };

    let mut out = String::with_capacity(expanded.len());
    let mut prev_separator = true; // strips leading separators as a side effect
    for c in expanded.chars() {
        if c == '/' {
            if !prev_separator {
                out.push('/');
            }
            prev_separator = true;
        } else {
            out.push(c);
            prev_separator = false;
        }
    }
    if out.ends_with('/') {
        out.pop();
    }

    if out.is_empty() {
        return Err(NameError::Empty);
    }
    if out.len() > TOPIC_NAME_MAX {
        return Err(NameError::TooLong(out.len()));
    }
    Ok(out)
}

/// Parse a name as a pinned subject identifier.
///
/// Only the canonical decimal form is accepted: no leading zeros (so `"0"`
/// itself is rejected) and a value below [`TOTAL_SUBJECT_COUNT`]. This keeps
/// the mapping from pinned names to subject identifiers injective.
pub fn parse_pinned(name: &str) -> Option<SubjectId> {
    if name.is_empty() || name.starts_with('0') {
        return None;
    }
    let mut value: u32 = 0;
    for byte in name.bytes() {
        if !byte.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u32::from(byte - b'0');
        if value >= u32::from(TOTAL_SUBJECT_COUNT) {
            return None;
        }
    }
    Some(SubjectId(value as u16))
}

/// Hash of a canonical topic name.
pub fn topic_hash(canonical: &str) -> TopicId {
    match parse_pinned(canonical) {
        Some(pinned) => TopicId(u64::from(pinned.get())),
        None => TopicId(xxh3_64(canonical.as_bytes())),
    }
}

/// Derive the subject identifier of a topic from its hash and eviction
/// counter. Pinned topics sit at their hash; everything else shifts by one
/// slot per eviction, modulo the dynamically allocated range.
pub fn subject_id(hash: TopicId, evictions: u64) -> SubjectId {
    if hash.is_pinned() {
        SubjectId(hash.get() as u16)
    } else {
        SubjectId((hash.get().wrapping_add(evictions) % u64::from(TOPIC_SUBJECT_COUNT)) as u16)
    }
}
