//! Log records and their scavenge projections
//!
//! [`LogRecord`] is the owned, fully materialized record. The chunk executor
//! never materializes records: it decodes each one into a reusable
//! [`RecordForExecutor`] that keeps the raw bytes and the handful of fields
//! needed for a keep/discard decision.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::stream::{TOMBSTONE_EVENT_NUMBER, event_types};

/// Position of a record in the logical log address space
pub type LogPosition = u64;

/// A record in the transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// An event written to a stream
    Prepare(PrepareRecord),
    /// Commit marker for previously written prepares
    Commit(CommitRecord),
    /// Log housekeeping (epochs and the like)
    System(SystemRecord),
}

/// An event written to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareRecord {
    pub log_position: LogPosition,
    pub stream_id: String,
    pub event_number: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Bytes,
}

/// Commit marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub log_position: LogPosition,
    pub transaction_position: LogPosition,
    pub first_event_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// Log housekeeping record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRecord {
    pub log_position: LogPosition,
    pub epoch_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl PrepareRecord {
    /// Whether this record hard-deletes its stream
    pub fn is_tombstone(&self) -> bool {
        self.event_type == event_types::STREAM_DELETED
    }

    /// Whether this record carries stream metadata
    pub fn is_metadata(&self) -> bool {
        self.event_type == event_types::METADATA
    }
}

impl LogRecord {
    /// Log position of the record
    pub fn log_position(&self) -> LogPosition {
        match self {
            LogRecord::Prepare(r) => r.log_position,
            LogRecord::Commit(r) => r.log_position,
            LogRecord::System(r) => r.log_position,
        }
    }

    /// Timestamp of the record
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            LogRecord::Prepare(r) => r.timestamp,
            LogRecord::Commit(r) => r.timestamp,
            LogRecord::System(r) => r.timestamp,
        }
    }

    /// Serialize to the on-disk encoding
    pub fn encode(&self) -> Result<Vec<u8>, LogError> {
        postcard::to_allocvec(self).map_err(|e| LogError::Serialization(e.to_string()))
    }

    /// Deserialize from the on-disk encoding
    pub fn decode(bytes: &[u8]) -> Result<Self, LogError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Borrowed mirror of [`LogRecord`]; field order must match exactly
#[derive(Deserialize)]
enum LogRecordRef<'a> {
    Prepare(#[serde(borrow)] PrepareRecordRef<'a>),
    Commit(CommitRecord),
    System(SystemRecord),
}

#[derive(Deserialize)]
struct PrepareRecordRef<'a> {
    log_position: LogPosition,
    stream_id: &'a str,
    event_number: u64,
    event_type: &'a str,
    timestamp: DateTime<Utc>,
    #[allow(dead_code)]
    data: &'a [u8],
}

/// A fully read record handed to the accumulator
#[derive(Debug, Clone, PartialEq)]
pub struct RecordForScavenge {
    /// The decoded record
    pub record: LogRecord,
    /// Size of the record's encoding in bytes
    pub size: usize,
}

/// Which decision a record needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordKind {
    /// Belongs to a stream; kept or discarded per stream facts
    Prepare,
    /// Not tied to a stream; passed through
    #[default]
    NonPrepare,
}

/// Decision-relevant view of a [`RecordForExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordView<'a> {
    Prepare {
        stream_id: &'a str,
        event_number: u64,
        timestamp: DateTime<Utc>,
        is_scavengable: bool,
    },
    NonPrepare,
}

/// Reusable record projection for chunk rewriting
///
/// Buffers are cleared and refilled for each record so that reading a chunk
/// does not allocate once the buffers have grown to the largest record.
#[derive(Debug, Clone, Default)]
pub struct RecordForExecutor {
    kind: RecordKind,
    log_position: LogPosition,
    stream_id: String,
    event_number: u64,
    timestamp: DateTime<Utc>,
    is_scavengable: bool,
    bytes: Vec<u8>,
}

impl RecordForExecutor {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer that receives the raw encoding before [`Self::decode_raw`]
    pub fn raw_buffer_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    /// Raw encoding of the current record
    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode the raw buffer into the projection fields
    pub fn decode_raw(&mut self) -> Result<(), postcard::Error> {
        let decoded: LogRecordRef<'_> = postcard::from_bytes(&self.bytes)?;
        match decoded {
            LogRecordRef::Prepare(prepare) => {
                self.kind = RecordKind::Prepare;
                self.log_position = prepare.log_position;
                self.stream_id.clear();
                self.stream_id.push_str(prepare.stream_id);
                self.event_number = prepare.event_number;
                self.timestamp = prepare.timestamp;
                self.is_scavengable = prepare.event_type != event_types::STREAM_DELETED
                    && prepare.event_number != TOMBSTONE_EVENT_NUMBER;
            }
            LogRecordRef::Commit(commit) => {
                self.set_non_prepare(commit.log_position, commit.timestamp);
            }
            LogRecordRef::System(system) => {
                self.set_non_prepare(system.log_position, system.timestamp);
            }
        }
        Ok(())
    }

    fn set_non_prepare(&mut self, log_position: LogPosition, timestamp: DateTime<Utc>) {
        self.kind = RecordKind::NonPrepare;
        self.log_position = log_position;
        self.stream_id.clear();
        self.event_number = 0;
        self.timestamp = timestamp;
        self.is_scavengable = false;
    }

    /// Shape of the current record
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Log position of the current record
    pub fn log_position(&self) -> LogPosition {
        self.log_position
    }

    /// Timestamp of the current record
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// View for keep/discard dispatch
    pub fn view(&self) -> RecordView<'_> {
        match self.kind {
            RecordKind::Prepare => RecordView::Prepare {
                stream_id: &self.stream_id,
                event_number: self.event_number,
                timestamp: self.timestamp,
                is_scavengable: self.is_scavengable,
            },
            RecordKind::NonPrepare => RecordView::NonPrepare,
        }
    }
}
