//! Entities persisted by the scavenge state store

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use tidelog_core::{
    DiscardPoint, IndexEntry, LogPosition, ScavengePoint, StreamHandle, StreamMetadata,
    TOMBSTONE_EVENT_NUMBER,
};

/// Lifecycle of an original stream row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamStatus {
    /// Discard points may still move
    #[default]
    Active,
    /// Tombstoned; everything that can go is already decided
    Spent,
    /// No policy can move the discard points until new metadata arrives
    Archived,
}

/// Everything known about an original stream
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OriginalStreamData {
    pub is_tombstoned: bool,
    pub max_age: Option<Duration>,
    pub max_count: Option<u64>,
    pub truncate_before: Option<u64>,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub status: StreamStatus,
}

impl OriginalStreamData {
    /// Replace the discard policies; discard points are kept
    pub fn set_metadata(&mut self, metadata: &StreamMetadata) {
        self.max_age = metadata.max_age;
        self.max_count = metadata.max_count;
        self.truncate_before = metadata.truncate_before;
    }

    /// Current discard policies
    pub fn metadata(&self) -> StreamMetadata {
        StreamMetadata {
            max_age: self.max_age,
            max_count: self.max_count,
            truncate_before: self.truncate_before,
        }
    }

    /// Facts the chunk executor needs
    pub fn chunk_execution_info(&self) -> ChunkExecutionInfo {
        ChunkExecutionInfo {
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
            maybe_discard_point: self.maybe_discard_point,
            max_age: self.max_age,
        }
    }

    /// Facts the index executor needs
    pub fn index_execution_info(&self) -> IndexExecutionInfo {
        IndexExecutionInfo {
            is_metastream: false,
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
        }
    }
}

/// Everything known about a metadata stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetastreamData {
    /// Whether the original stream is tombstoned
    pub is_tombstoned: bool,
    /// Superseded metadata records fall below this
    pub discard_point: DiscardPoint,
    /// Position of the latest metadata record
    pub last_metadata_position: Option<LogPosition>,
}

impl MetastreamData {
    /// Facts the chunk executor needs
    pub fn chunk_execution_info(&self) -> ChunkExecutionInfo {
        ChunkExecutionInfo {
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
            maybe_discard_point: DiscardPoint::KEEP_ALL,
            max_age: None,
        }
    }

    /// Facts the index executor needs
    pub fn index_execution_info(&self) -> IndexExecutionInfo {
        IndexExecutionInfo {
            is_metastream: true,
            is_tombstoned: self.is_tombstoned,
            discard_point: self.discard_point,
        }
    }
}

/// Bounds of every record timestamp in one logical chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTimeStampRange {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl ChunkTimeStampRange {
    /// Range holding a single timestamp
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            min: timestamp,
            max: timestamp,
        }
    }

    /// Widen to include `timestamp`
    pub fn extend(&mut self, timestamp: DateTime<Utc>) {
        self.min = self.min.min(timestamp);
        self.max = self.max.max(timestamp);
    }
}

/// Instant before which an event is older than `max_age`
pub fn age_cutoff(effective_now: DateTime<Utc>, max_age: Duration) -> Option<DateTime<Utc>> {
    effective_now.checked_sub_signed(TimeDelta::from_std(max_age).ok()?)
}

/// Per-stream facts consulted for every record of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExecutionInfo {
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
    pub maybe_discard_point: DiscardPoint,
    pub max_age: Option<Duration>,
}

impl ChunkExecutionInfo {
    /// Whether a scavengable record of the stream can be dropped
    pub fn should_discard(
        &self,
        event_number: u64,
        timestamp: DateTime<Utc>,
        effective_now: DateTime<Utc>,
    ) -> bool {
        if self.is_tombstoned || self.discard_point.should_discard(event_number) {
            return true;
        }

        self.maybe_discard_point.should_discard(event_number)
            && self
                .max_age
                .and_then(|age| age_cutoff(effective_now, age))
                .is_some_and(|cutoff| timestamp < cutoff)
    }
}

/// Per-stream facts consulted for every index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexExecutionInfo {
    pub is_metastream: bool,
    pub is_tombstoned: bool,
    pub discard_point: DiscardPoint,
}

impl IndexExecutionInfo {
    /// Whether the index entry for `event_number` can be removed
    pub fn should_discard(&self, event_number: u64) -> bool {
        (self.is_tombstoned && event_number != TOMBSTONE_EVENT_NUMBER)
            || self.discard_point.should_discard(event_number)
    }
}

/// Where a scavenge run is, persisted with the unit of work it follows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScavengeCheckpoint {
    Accumulating {
        scavenge_point: ScavengePoint,
        next_log_position: LogPosition,
    },
    Calculating {
        scavenge_point: ScavengePoint,
        /// Last stream fully calculated; `None` before the first
        done_stream_handle: StreamHandle,
    },
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    },
    MergingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    },
    ExecutingIndex {
        scavenge_point: ScavengePoint,
        last_entry: Option<IndexEntry>,
    },
    Cleaning {
        scavenge_point: ScavengePoint,
    },
    Done {
        scavenge_point: ScavengePoint,
    },
}

impl ScavengeCheckpoint {
    /// Scavenge point the run belongs to
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            Self::Accumulating { scavenge_point, .. }
            | Self::Calculating { scavenge_point, .. }
            | Self::ExecutingChunks { scavenge_point, .. }
            | Self::MergingChunks { scavenge_point, .. }
            | Self::ExecutingIndex { scavenge_point, .. }
            | Self::Cleaning { scavenge_point }
            | Self::Done { scavenge_point } => scavenge_point,
        }
    }

    /// Short phase name for logs
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Accumulating { .. } => "accumulating",
            Self::Calculating { .. } => "calculating",
            Self::ExecutingChunks { .. } => "executing_chunks",
            Self::MergingChunks { .. } => "merging_chunks",
            Self::ExecutingIndex { .. } => "executing_index",
            Self::Cleaning { .. } => "cleaning",
            Self::Done { .. } => "done",
        }
    }

    /// Whether the run has finished
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

impl fmt::Display for ScavengeCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.phase(), self.scavenge_point())?;
        match self {
            Self::Accumulating {
                next_log_position, ..
            } => write!(f, " next position {next_log_position}"),
            Self::Calculating {
                done_stream_handle, ..
            } if !done_stream_handle.is_none() => write!(f, " done {done_stream_handle}"),
            Self::ExecutingChunks {
                done_logical_chunk_number: Some(n),
                ..
            }
            | Self::MergingChunks {
                done_logical_chunk_number: Some(n),
                ..
            } => write!(f, " done chunk {n}"),
            Self::ExecutingIndex {
                last_entry: Some(entry),
                ..
            } => write!(f, " after position {}", entry.log_position),
            _ => Ok(()),
        }
    }
}
