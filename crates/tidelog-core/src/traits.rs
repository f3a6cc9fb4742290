//! Collaborator traits for the scavenge engine
//!
//! These traits describe what the scavenge engine needs from the rest of the
//! database, so the engine can run against the file-backed log as well as
//! against test fixtures.
//!
//! ## Key Traits
//!
//! - [`ChunkReader`]: enumerate chunks and read records from them
//! - [`ChunkManager`]: write replacement chunks and switch them in
//! - [`IndexReader`]: raw, unfiltered per-stream index lookups
//! - [`IndexScavenger`]: page through and prune the index
//! - [`ScavengePointSource`]: read and append scavenge points

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkInfo;
use crate::error::LogError;
use crate::record::{LogPosition, RecordForExecutor, RecordForScavenge};
use crate::scavenge_point::ScavengePoint;
use crate::stream::StreamHandle;

/// Sequential reader over one chunk
pub trait ChunkRecordReader {
    /// Load the next record into `record`; returns false at end of chunk
    fn read_next(&mut self, record: &mut RecordForExecutor) -> Result<bool, LogError>;
}

/// Read access to chunks
pub trait ChunkReader: Send + Sync {
    /// Size of one logical chunk in log positions
    fn chunk_size(&self) -> u64;

    /// All physical chunks, ordered by first logical chunk number
    fn chunks(&self) -> Result<Vec<ChunkInfo>, LogError>;

    /// Records with `from <= log_position < until`, in log order, at most `max_count`
    fn read_forward(
        &self,
        from: LogPosition,
        until: LogPosition,
        max_count: usize,
    ) -> Result<Vec<RecordForScavenge>, LogError>;

    /// Open a sequential reader over a physical chunk
    fn open_chunk<'a>(
        &'a self,
        chunk: &ChunkInfo,
    ) -> Result<Box<dyn ChunkRecordReader + 'a>, LogError>;

    /// Stream of the prepare stored at `position`, if any
    fn stream_id_at(&self, position: LogPosition) -> Result<Option<String>, LogError>;
}

/// Writer for one replacement chunk
pub trait ChunkWriter: Send {
    /// Append a kept record
    fn write_record(&mut self, record: &RecordForExecutor) -> Result<(), LogError>;

    /// Finish the chunk and atomically replace every chunk it covers
    fn complete(self: Box<Self>) -> Result<ChunkInfo, LogError>;

    /// Drop the partial chunk; the chunks it would have replaced are untouched
    fn abort(self: Box<Self>);
}

/// Creates replacement chunks
pub trait ChunkManager: ChunkReader {
    /// Start a chunk covering logical chunks `chunk_start_number..=chunk_end_number`
    fn create_chunk_writer<'a>(
        &'a self,
        chunk_start_number: u32,
        chunk_end_number: u32,
    ) -> Result<Box<dyn ChunkWriter + 'a>, LogError>;
}

/// One event as seen by the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventInfo {
    pub event_number: u64,
    pub log_position: LogPosition,
    /// Exact timestamp, when the index can supply it cheaply
    pub timestamp: Option<DateTime<Utc>>,
}

/// Raw index lookups used by the calculator
///
/// Implementations must ignore metadata, truncation and deletion state and
/// report exactly what is indexed.
pub trait IndexReader: Send + Sync {
    /// Highest event number of the stream at or before the scavenge point
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: LogPosition,
    ) -> Result<Option<u64>, LogError>;

    /// Events with `event_number >= from_event_number`, ascending, at most `max_count`
    fn read_event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: u64,
        max_count: usize,
        scavenge_point: LogPosition,
    ) -> Result<Vec<EventInfo>, LogError>;
}

/// One index entry
///
/// Entries are keyed by stream hash, so entries of colliding streams are
/// interleaved and the stream must be recovered from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub stream_hash: u64,
    pub event_number: u64,
    pub log_position: LogPosition,
}

/// Index pruning
pub trait IndexScavenger: Send + Sync {
    /// Entries strictly after `after` in key order, at most `max_count`
    fn index_entries(
        &self,
        after: Option<&IndexEntry>,
        max_count: usize,
    ) -> Result<Vec<IndexEntry>, LogError>;

    /// Remove entries; missing entries are ignored. Returns how many were removed.
    fn remove_index_entries(&self, entries: &[IndexEntry]) -> Result<usize, LogError>;
}

/// Scavenge point storage
pub trait ScavengePointSource: Send + Sync {
    /// Most recently written scavenge point
    fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>, LogError>;

    /// Append a new scavenge point
    fn add_scavenge_point(
        &self,
        effective_now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<ScavengePoint, LogError>;
}
