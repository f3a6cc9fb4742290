//! State backend abstraction
//!
//! A backend is a small set of ordered byte-keyed tables with a single
//! explicit transaction. Writes are only legal inside the transaction; reads
//! either see committed data only or committed data overlaid with the open
//! transaction's writes.

use crate::error::Result;

/// Tables of the scavenge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateTable {
    /// Stream hash to the first stream id seen with it
    HashUsers,
    /// Stream ids known to share a hash with another stream
    Collisions,
    /// Stream handle to original stream data
    OriginalStreams,
    /// Stream handle to metastream data
    Metastreams,
    /// Logical chunk number to timestamp range
    ChunkTimeStampRanges,
    /// Logical chunk number to accumulated weight
    ChunkWeights,
    /// The single checkpoint row
    Checkpoint,
}

impl StateTable {
    /// Number of tables
    pub const COUNT: usize = 7;

    /// Every table
    pub const ALL: [StateTable; Self::COUNT] = [
        StateTable::HashUsers,
        StateTable::Collisions,
        StateTable::OriginalStreams,
        StateTable::Metastreams,
        StateTable::ChunkTimeStampRanges,
        StateTable::ChunkWeights,
        StateTable::Checkpoint,
    ];

    /// Dense index of the table
    pub fn index(self) -> usize {
        self as usize
    }

    /// Stable table name
    pub fn name(self) -> &'static str {
        match self {
            StateTable::HashUsers => "hash_users",
            StateTable::Collisions => "collisions",
            StateTable::OriginalStreams => "original_streams",
            StateTable::Metastreams => "metastreams",
            StateTable::ChunkTimeStampRanges => "chunk_timestamp_ranges",
            StateTable::ChunkWeights => "chunk_weights",
            StateTable::Checkpoint => "checkpoint",
        }
    }
}

/// Which data a read observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadView {
    /// Only committed data
    Committed,
    /// Committed data plus the open transaction's writes
    Pending,
}

/// Type alias for scan results
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

/// Transactional table storage for the scavenge state
///
/// At most one transaction is open at a time. `begin` while a transaction is
/// open, `commit`/`rollback` without one, and any write outside a transaction
/// return [`ScavengeError::InvariantViolation`].
///
/// [`ScavengeError::InvariantViolation`]: crate::error::ScavengeError::InvariantViolation
pub trait StateBackend: Send + Sync {
    /// Open the transaction
    fn begin(&self) -> Result<()>;

    /// Make every write of the transaction visible atomically
    fn commit(&self) -> Result<()>;

    /// Discard every write of the transaction
    fn rollback(&self) -> Result<()>;

    /// Whether a transaction is open
    fn in_transaction(&self) -> bool;

    /// Read one value
    fn get(&self, table: StateTable, key: &[u8], view: ReadView) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value
    fn put(&self, table: StateTable, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove a value, returning whether it existed
    fn delete(&self, table: StateTable, key: &[u8]) -> Result<bool>;

    /// Committed entries with keys strictly after `after`, ascending, at most `limit`
    fn scan(&self, table: StateTable, after: Option<&[u8]>, limit: usize) -> Result<ScanResults>;
}
