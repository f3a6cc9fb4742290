//! Chunk identity
//!
//! The log address space is cut into logical chunks of a fixed size. A
//! physical chunk file covers one logical chunk when first written and may
//! cover a contiguous range of them after merging.

use serde::{Deserialize, Serialize};

use crate::record::LogPosition;

/// Logical chunk number that contains `position`
pub fn chunk_number_of(position: LogPosition, chunk_size: u64) -> u32 {
    u32::try_from(position / chunk_size.max(1)).unwrap_or(u32::MAX)
}

/// Description of one physical chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// First logical chunk covered
    pub chunk_start_number: u32,
    /// Last logical chunk covered (inclusive)
    pub chunk_end_number: u32,
    /// First log position covered
    pub start_position: LogPosition,
    /// One past the last log position covered
    pub end_position: LogPosition,
    /// Bytes of record data stored in the file
    pub physical_data_size: u64,
    /// Whether the chunk is complete and will not be appended to
    pub is_read_only: bool,
}

impl ChunkInfo {
    /// Logical chunk numbers covered by this chunk
    pub fn logical_chunks(&self) -> std::ops::RangeInclusive<u32> {
        self.chunk_start_number..=self.chunk_end_number
    }

    /// Whether `position` falls inside this chunk
    pub fn contains(&self, position: LogPosition) -> bool {
        position >= self.start_position && position < self.end_position
    }
}
