//! Hash-keyed stream index
//!
//! Entries are ordered by `(stream hash, event number, log position)`. Two
//! streams whose names share a hash are interleaved in the same key range,
//! exactly like an on-disk hash index, so lookups by name have to confirm the
//! stream of each entry against the log.

use std::collections::BTreeMap;
use std::ops::Bound;

use chrono::{DateTime, Utc};

use tidelog_core::{IndexEntry, LogPosition};

/// In-memory hash index with per-entry timestamps
#[derive(Debug, Default)]
pub struct HashIndex {
    entries: BTreeMap<IndexEntry, DateTime<Utc>>,
}

impl HashIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn insert(&mut self, entry: IndexEntry, timestamp: DateTime<Utc>) {
        self.entries.insert(entry, timestamp);
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&mut self, entry: &IndexEntry) -> bool {
        self.entries.remove(entry).is_some()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for `hash` with `event_number >= from`, ascending
    pub fn range_for_hash(
        &self,
        hash: u64,
        from: u64,
    ) -> impl DoubleEndedIterator<Item = (&IndexEntry, &DateTime<Utc>)> {
        let start = IndexEntry {
            stream_hash: hash,
            event_number: from,
            log_position: 0,
        };
        let end = IndexEntry {
            stream_hash: hash,
            event_number: u64::MAX,
            log_position: LogPosition::MAX,
        };
        self.entries.range(start..=end)
    }

    /// Entries strictly after `after`, ascending
    pub fn entries_after(
        &self,
        after: Option<&IndexEntry>,
    ) -> impl Iterator<Item = (&IndexEntry, &DateTime<Utc>)> {
        let lower = match after {
            Some(entry) => Bound::Excluded(*entry),
            None => Bound::Unbounded,
        };
        self.entries.range((lower, Bound::Unbounded))
    }
}
