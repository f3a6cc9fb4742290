//! Scavenge points
//!
//! A scavenge point is an ordinary event appended to [`SCAVENGE_POINTS_STREAM`].
//! Its log position bounds everything a scavenge run may look at, and its
//! `effective_now` is the clock that max-age policies are measured against.
//!
//! [`SCAVENGE_POINTS_STREAM`]: crate::stream::SCAVENGE_POINTS_STREAM

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::chunk_number_of;
use crate::record::LogPosition;

/// Upper bound and clock of one scavenge run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScavengePoint {
    /// Log position of the scavenge point record
    pub position: LogPosition,
    /// Event number within the scavenge points stream
    pub event_number: u64,
    /// Time that age-based policies are evaluated against
    pub effective_now: DateTime<Utc>,
    /// Minimum chunk weight for a chunk to be rewritten
    pub threshold: f32,
}

impl ScavengePoint {
    /// Logical chunk that contains the scavenge point record
    pub fn chunk_number(&self, chunk_size: u64) -> u32 {
        chunk_number_of(self.position, chunk_size)
    }
}

impl fmt::Display for ScavengePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SP-{}@{}", self.event_number, self.position)
    }
}

/// JSON body of a `$scavengePoint` event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScavengePointPayload {
    pub effective_now: DateTime<Utc>,
    pub threshold: f32,
}

impl ScavengePointPayload {
    /// Encode as event data
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from event data
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
