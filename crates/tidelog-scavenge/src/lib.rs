//! # Tidelog Scavenge
//!
//! Resumable, checkpointed scavenge (log compaction) for the tidelog event
//! log.
//!
//! A run is bounded by a [`ScavengePoint`](tidelog_core::ScavengePoint) and
//! moves through these phases, committing a checkpoint with each unit of work:
//!
//! 1. [`Accumulator`]: one pass over the log collecting metadata, tombstones,
//!    stream hash collisions and chunk timestamp ranges
//! 2. [`Calculator`]: discard points and chunk weights per stream
//! 3. [`ChunkExecutor`]: rewrites weighted chunks on parallel workers
//! 4. [`ChunkMerger`]: merges small adjacent chunks
//! 5. [`IndexExecutor`]: prunes index entries of discarded events
//! 6. [`Cleaner`]: drops state rows that can no longer matter
//!
//! [`Scavenger`] runs and resumes the phases. State lives behind the
//! [`StateBackend`] trait, with in-memory and redb implementations.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidelog_core::Blake3StreamHasher;
//! use tidelog_scavenge::{InMemoryStateBackend, ScavengeConfig, ScavengeState, Scavenger};
//! use tidelog_storage::{FileLog, FileLogConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hasher = Arc::new(Blake3StreamHasher);
//! let log = Arc::new(FileLog::open(FileLogConfig::default(), hasher.clone())?);
//! let state = ScavengeState::new(InMemoryStateBackend::new(), hasher);
//! let scavenger = Scavenger::new(log, state, ScavengeConfig::default());
//! scavenger.run(&CancellationToken::new())?;
//! # Ok(())
//! # }
//! ```

pub mod accumulator;
pub mod calculator;
pub mod chunk_executor;
pub mod chunk_merger;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod index_executor;
pub mod pool;
pub mod scavenger;
pub mod state;

// Re-export main types
pub use accumulator::Accumulator;
pub use calculator::Calculator;
pub use chunk_executor::{ChunkExecutionStats, ChunkExecutor};
pub use chunk_merger::ChunkMerger;
pub use cleaner::Cleaner;
pub use config::ScavengeConfig;
pub use error::{Result, ScavengeError};
pub use index_executor::IndexExecutor;
pub use pool::{ReusableSlot, SlotLease, SlotPool, SlotState};
pub use scavenger::{ScavengeLog, ScavengeOutcome, Scavenger};
pub use state::{
    InMemoryStateBackend, RedbStateBackend, RedbStateConfig, ScavengeCheckpoint, ScavengeState,
    ScavengeTransaction, StateBackend, StreamStatus,
};
