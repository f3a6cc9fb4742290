//! # Tidelog Core
//!
//! Core types, collaborator traits, and errors for the tidelog event log.
//!
//! The log is a sequence of immutable chunks holding [`LogRecord`]s. Streams
//! are addressed by [`StreamHandle`], discard decisions are expressed as
//! [`DiscardPoint`]s, and the scavenge engine talks to the log through the
//! traits in [`traits`].
//!
//! ## Key Types
//!
//! - [`StreamHandle`]: hash-or-identifier reference to a stream
//! - [`DiscardPoint`]: boundary below which a stream's events may be removed
//! - [`StreamMetadata`]: max-age, max-count and truncate-before policies
//! - [`ScavengePoint`]: upper bound and clock of a scavenge run
//! - [`RecordForExecutor`]: reusable record projection for chunk rewriting

pub mod chunk;
pub mod discard;
pub mod error;
pub mod metadata;
pub mod record;
pub mod scavenge_point;
pub mod stream;
pub mod traits;

// Re-export main types
pub use chunk::*;
pub use discard::*;
pub use error::*;
pub use metadata::*;
pub use record::*;
pub use scavenge_point::*;
pub use stream::*;
pub use traits::*;
