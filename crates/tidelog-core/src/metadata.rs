//! Stream metadata
//!
//! Metadata lives in the stream's metastream as JSON. Only the discard
//! policies are interpreted here; ACLs and custom keys are ignored.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Discard policies declared for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Events older than this may be removed
    pub max_age: Option<Duration>,
    /// Only the newest `max_count` events are retained
    pub max_count: Option<u64>,
    /// Events numbered below this may be removed
    pub truncate_before: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RawStreamMetadata {
    #[serde(rename = "$maxAge", default, skip_serializing_if = "Option::is_none")]
    max_age: Option<i64>,
    #[serde(rename = "$maxCount", default, skip_serializing_if = "Option::is_none")]
    max_count: Option<i64>,
    #[serde(rename = "$tb", default, skip_serializing_if = "Option::is_none")]
    truncate_before: Option<i64>,
}

impl StreamMetadata {
    /// Metadata that declares no policy
    pub const EMPTY: Self = Self {
        max_age: None,
        max_count: None,
        truncate_before: None,
    };

    /// Set the max-age policy
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Set the max-count policy
    pub fn with_max_count(mut self, max_count: u64) -> Self {
        self.max_count = Some(max_count);
        self
    }

    /// Set the truncate-before policy
    pub fn with_truncate_before(mut self, truncate_before: u64) -> Self {
        self.truncate_before = Some(truncate_before);
        self
    }

    /// Parse the JSON body of a `$metadata` event
    ///
    /// Negative values are treated as absent.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawStreamMetadata = serde_json::from_slice(data)?;
        let positive = |v: Option<i64>| v.and_then(|v| u64::try_from(v).ok());
        Ok(Self {
            max_age: positive(raw.max_age).map(Duration::from_secs),
            max_count: positive(raw.max_count),
            truncate_before: positive(raw.truncate_before),
        })
    }

    /// Encode as the JSON body of a `$metadata` event
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let clamp = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let raw = RawStreamMetadata {
            max_age: self.max_age.map(|d| clamp(d.as_secs())),
            max_count: self.max_count.map(clamp),
            truncate_before: self.truncate_before.map(clamp),
        };
        serde_json::to_vec(&raw)
    }

    /// Whether any discard policy is declared
    pub fn has_discard_policy(&self) -> bool {
        self.max_age.is_some() || self.max_count.is_some() || self.truncate_before.is_some()
    }
}
