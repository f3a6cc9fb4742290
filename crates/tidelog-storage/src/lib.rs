//! # Tidelog Storage
//!
//! Chunked, append-only file log for tidelog.
//!
//! ## Features
//!
//! - **FileLog**: appends records into fixed-size logical chunks and replays
//!   them on open
//! - **HashIndex**: `(stream hash, event number, log position)` index with
//!   collision-tolerant lookups
//! - **Chunk files**: length-prefixed postcard records, switched in atomically
//!   when a chunk is rewritten or merged
//!
//! [`FileLog`] implements every collaborator trait of the scavenge engine.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use tidelog_core::Blake3StreamHasher;
//! use tidelog_storage::{FileLog, FileLogConfig};
//!
//! let log = FileLog::open(FileLogConfig::with_base_dir("./data"), Arc::new(Blake3StreamHasher))?;
//! log.append_event("orders", "OrderPlaced", Bytes::from("{}"), chrono::Utc::now())?;
//! log.complete_chunk()?;
//! ```

pub mod chunk_file;
pub mod file_log;
pub mod index;

// Re-exports
pub use file_log::{AppendResult, FileLog, FileLogConfig};
pub use index::HashIndex;
