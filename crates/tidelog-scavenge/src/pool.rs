//! Reusable per-record slots
//!
//! A [`ReusableSlot`] holds one value that is handed out and returned many
//! times without reallocating. Ownership is tracked by an atomic state word
//! rather than a lock:
//!
//! ```text
//! Free -> LockedToAcquire -> Acquired -> LockedToRelease -> Free
//! ```
//!
//! Acquiring a slot that is not free is resource contention and fails.
//! Releasing from any state other than `Acquired` means two owners existed,
//! which is unrecoverable, so the release panics. A lease may be released on
//! a different thread from the one that acquired it.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::error;

use crate::error::{Result, ScavengeError};

const FREE: u8 = 0;
const LOCKED_TO_ACQUIRE: u8 = 1;
const ACQUIRED: u8 = 2;
const LOCKED_TO_RELEASE: u8 = 3;

/// Observable state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    LockedToAcquire,
    Acquired,
    LockedToRelease,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            FREE => Self::Free,
            LOCKED_TO_ACQUIRE => Self::LockedToAcquire,
            ACQUIRED => Self::Acquired,
            _ => Self::LockedToRelease,
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::LockedToAcquire => "locked to acquire",
            Self::Acquired => "acquired",
            Self::LockedToRelease => "locked to release",
        };
        f.write_str(name)
    }
}

/// A value with a single owner at a time
pub struct ReusableSlot<T> {
    value: UnsafeCell<T>,
    state: AtomicU8,
}

// SAFETY: the state word guarantees at most one lease exists, and only the
// lease touches `value`. A shared lease hands out `&T`, hence `T: Sync`.
unsafe impl<T: Send + Sync> Sync for ReusableSlot<T> {}

impl<T> ReusableSlot<T> {
    /// Create a free slot holding `value`
    pub fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
            state: AtomicU8::new(FREE),
        }
    }

    /// Current state
    pub fn state(&self) -> SlotState {
        SlotState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Take the slot
    ///
    /// Fails with [`ScavengeError::ResourceContention`] unless the slot is free.
    pub fn acquire(&self) -> Result<SlotLease<'_, T>> {
        self.state
            .compare_exchange(FREE, LOCKED_TO_ACQUIRE, Ordering::Acquire, Ordering::Acquire)
            .map_err(|actual| {
                ScavengeError::contention(format!(
                    "slot acquired while {}",
                    SlotState::from_raw(actual)
                ))
            })?;
        self.transition(LOCKED_TO_ACQUIRE, ACQUIRED);
        Ok(SlotLease { slot: self })
    }

    fn release(&self) {
        self.transition(ACQUIRED, LOCKED_TO_RELEASE);
        self.transition(LOCKED_TO_RELEASE, FREE);
    }

    fn transition(&self, from: u8, to: u8) {
        if let Err(actual) =
            self.state
                .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
        {
            let (from, to, actual) = (
                SlotState::from_raw(from),
                SlotState::from_raw(to),
                SlotState::from_raw(actual),
            );
            error!(%from, %to, %actual, "Reusable slot in unexpected state");
            panic!("reusable slot moved {from} -> {to} while {actual}");
        }
    }

    /// Consume the slot and return its value
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for ReusableSlot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for ReusableSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReusableSlot")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a slot's value; returns the slot on drop
///
/// A lease can move to another thread, but it is only shared across threads
/// when the value itself is `Sync`:
///
/// ```compile_fail
/// use std::cell::Cell;
/// use tidelog_scavenge::ReusableSlot;
///
/// fn share<T: Sync>(_: &T) {}
///
/// let slot = ReusableSlot::new(Cell::new(0u8));
/// share(&slot.acquire().unwrap());
/// ```
pub struct SlotLease<'a, T> {
    slot: &'a ReusableSlot<T>,
}

// SAFETY: the lease is the only accessor of the value while it lives, and
// releasing only touches the atomic state word.
unsafe impl<T: Send> Send for SlotLease<'_, T> {}

impl<T> Deref for SlotLease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the slot is in the Acquired state and this lease owns it
        unsafe { &*self.slot.value.get() }
    }
}

impl<T> DerefMut for SlotLease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing through the lease
        unsafe { &mut *self.slot.value.get() }
    }
}

impl<T> Drop for SlotLease<'_, T> {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Fixed set of slots, one per worker
pub struct SlotPool<T> {
    slots: Vec<ReusableSlot<T>>,
}

impl<T: Default> SlotPool<T> {
    /// Create `size` free slots
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| ReusableSlot::default()).collect(),
        }
    }
}

impl<T> SlotPool<T> {
    /// Slot reserved for `worker`
    pub fn slot(&self, worker: usize) -> Result<&ReusableSlot<T>> {
        self.slots
            .get(worker)
            .ok_or_else(|| ScavengeError::invariant(format!("no slot for worker {worker}")))
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
