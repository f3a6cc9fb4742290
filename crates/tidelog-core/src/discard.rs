//! Discard points
//!
//! A [`DiscardPoint`] names the first event number of a stream that must be
//! kept. Every event below it may be physically removed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Boundary below which a stream's events are eligible for removal
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DiscardPoint(u64);

impl DiscardPoint {
    /// Nothing is discardable
    pub const KEEP_ALL: Self = Self(0);

    /// Everything except the tombstone record is discardable
    pub const DISCARD_ALL: Self = Self(u64::MAX);

    /// Discard every event with a number strictly below `event_number`
    pub const fn discard_before(event_number: u64) -> Self {
        Self(event_number)
    }

    /// Discard every event up to and including `event_number`
    pub const fn discard_including(event_number: u64) -> Self {
        Self(event_number.saturating_add(1))
    }

    /// First event number that survives
    pub const fn first_event_number_to_keep(self) -> u64 {
        self.0
    }

    /// Whether an event with this number may be removed
    pub const fn should_discard(self, event_number: u64) -> bool {
        event_number < self.0
    }

    /// Whether this point discards nothing
    pub const fn is_keep_all(self) -> bool {
        self.0 == 0
    }

    /// The later of two discard points
    pub fn or(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for DiscardPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::KEEP_ALL => write!(f, "KeepAll"),
            Self::DISCARD_ALL => write!(f, "DiscardAll"),
            Self(n) => write!(f, "DiscardBefore({n})"),
        }
    }
}
