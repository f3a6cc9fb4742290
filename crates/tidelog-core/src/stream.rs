//! Stream naming, hashing, and handles
//!
//! Streams are addressed by a 64-bit hash of their name in the common case.
//! Once two names are known to share a hash, both are addressed by their full
//! identifier instead. [`StreamHandle`] carries either form.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix that turns a stream name into the name of its metadata stream
pub const METASTREAM_PREFIX: &str = "$$";

/// Stream that holds scavenge point markers
pub const SCAVENGE_POINTS_STREAM: &str = "$scavengePoints";

/// Event number carried by a stream's tombstone record
pub const TOMBSTONE_EVENT_NUMBER: u64 = u64::MAX;

/// Well-known system event types
pub mod event_types {
    /// Stream metadata written to a metastream
    pub const METADATA: &str = "$metadata";
    /// Hard delete marker written to an original stream
    pub const STREAM_DELETED: &str = "$streamDeleted";
    /// Scavenge point marker
    pub const SCAVENGE_POINT: &str = "$scavengePoint";
}

/// Whether a stream name refers to a metadata stream
pub fn is_metastream(stream_id: &str) -> bool {
    stream_id.starts_with(METASTREAM_PREFIX)
}

/// Name of the metadata stream paired with `stream_id`
pub fn metastream_of(stream_id: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream_id}")
}

/// Name of the original stream a metastream describes
///
/// Returns the input unchanged when it is not a metastream.
pub fn original_stream_of(metastream_id: &str) -> &str {
    metastream_id
        .strip_prefix(METASTREAM_PREFIX)
        .unwrap_or(metastream_id)
}

/// Maps stream names to 64-bit hashes
///
/// The index and the scavenge state must use the same hasher, otherwise hash
/// handles computed by one are meaningless to the other.
pub trait StreamHasher: Send + Sync {
    /// Hash a stream name
    fn hash(&self, stream_id: &str) -> u64;
}

/// Default hasher: the first eight bytes of the BLAKE3 digest
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3StreamHasher;

impl StreamHasher for Blake3StreamHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        let digest = blake3::hash(stream_id.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

/// Reference to a stream, by hash or by full identifier
///
/// The variant order and payloads are persisted; do not reorder them.
/// The derived ordering (`None < Hash < Id`) matches [`StreamHandle::to_key`]
/// byte ordering so that persisted scans visit handles in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum StreamHandle {
    /// No stream; used as the "before everything" cursor
    #[default]
    None,
    /// A stream whose hash is not shared with any other known stream
    Hash(u64),
    /// A stream whose hash collides with at least one other stream
    Id(String),
}

const KEY_TAG_NONE: u8 = 0;
const KEY_TAG_HASH: u8 = 1;
const KEY_TAG_ID: u8 = 2;

impl StreamHandle {
    /// Handle for a stream addressed by hash
    pub fn for_hash(hash: u64) -> Self {
        Self::Hash(hash)
    }

    /// Handle for a stream addressed by name
    pub fn for_id(stream_id: impl Into<String>) -> Self {
        Self::Id(stream_id.into())
    }

    /// Whether this is the `None` handle
    pub fn is_none(&self) -> bool {
        matches!(self, StreamHandle::None)
    }

    /// Order-preserving key encoding used by the state tables
    pub fn to_key(&self) -> Vec<u8> {
        match self {
            StreamHandle::None => vec![KEY_TAG_NONE],
            StreamHandle::Hash(hash) => {
                let mut key = Vec::with_capacity(9);
                key.push(KEY_TAG_HASH);
                key.extend_from_slice(&hash.to_be_bytes());
                key
            }
            StreamHandle::Id(id) => {
                let mut key = Vec::with_capacity(1 + id.len());
                key.push(KEY_TAG_ID);
                key.extend_from_slice(id.as_bytes());
                key
            }
        }
    }

    /// Decode a key produced by [`StreamHandle::to_key`]
    pub fn from_key(key: &[u8]) -> Option<Self> {
        let (&tag, rest) = key.split_first()?;
        match tag {
            KEY_TAG_NONE if rest.is_empty() => Some(StreamHandle::None),
            KEY_TAG_HASH => {
                let bytes: [u8; 8] = rest.try_into().ok()?;
                Some(StreamHandle::Hash(u64::from_be_bytes(bytes)))
            }
            KEY_TAG_ID => std::str::from_utf8(rest)
                .ok()
                .map(|id| StreamHandle::Id(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamHandle::None => write!(f, "None"),
            StreamHandle::Hash(hash) => write!(f, "Hash:{hash:016x}"),
            StreamHandle::Id(id) => write!(f, "Id:{id}"),
        }
    }
}
