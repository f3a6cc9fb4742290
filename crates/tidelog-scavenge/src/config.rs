//! Scavenge configuration

use serde::{Deserialize, Serialize};

/// Tunables for a scavenge run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScavengeConfig {
    /// Minimum chunk weight for a chunk to be rewritten; negative rewrites every chunk
    pub threshold: f32,
    /// Worker threads used to rewrite chunks
    pub chunk_executor_threads: usize,
    /// Records larger than this abort accumulation as corrupt
    pub max_record_size: usize,
    /// Records accumulated between commits, in addition to chunk boundaries
    pub accumulator_commit_every: usize,
    /// Streams calculated per committed batch
    pub calculator_batch_size: usize,
    /// Page size for index reads
    pub calculator_buffer_size: usize,
    /// Whether commit and system records survive chunk rewrites
    pub retain_non_prepare_records: bool,
    /// Whether small adjacent chunks are merged after execution
    pub merge_chunks: bool,
    /// Whether the cleaner also removes archived stream rows
    pub clean_archived: bool,
}

impl Default for ScavengeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            chunk_executor_threads: 1,
            max_record_size: 16 * 1024 * 1024, // 16MB
            accumulator_commit_every: 10_000,
            calculator_batch_size: 500,
            calculator_buffer_size: 1_000,
            retain_non_prepare_records: true,
            merge_chunks: true,
            clean_archived: false,
        }
    }
}

impl ScavengeConfig {
    /// Set the chunk weight threshold
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the number of chunk executor workers (at least one)
    pub fn with_chunk_executor_threads(mut self, threads: usize) -> Self {
        self.chunk_executor_threads = threads.max(1);
        self
    }

    /// Set the accumulator commit interval
    pub fn with_accumulator_commit_every(mut self, records: usize) -> Self {
        self.accumulator_commit_every = records.max(1);
        self
    }

    /// Set the calculator batch size
    pub fn with_calculator_batch_size(mut self, streams: usize) -> Self {
        self.calculator_batch_size = streams.max(1);
        self
    }

    /// Set the index page size
    pub fn with_calculator_buffer_size(mut self, entries: usize) -> Self {
        self.calculator_buffer_size = entries.max(1);
        self
    }

    /// Enable or disable chunk merging
    pub fn with_merge_chunks(mut self, enabled: bool) -> Self {
        self.merge_chunks = enabled;
        self
    }

    /// Enable or disable cleaning of archived rows
    pub fn with_clean_archived(mut self, enabled: bool) -> Self {
        self.clean_archived = enabled;
        self
    }

    /// Keep or drop non-prepare records during rewrites
    pub fn with_retain_non_prepare_records(mut self, retain: bool) -> Self {
        self.retain_non_prepare_records = retain;
        self
    }

    /// Whether a chunk of this weight is rewritten
    pub fn should_execute(&self, weight: f32) -> bool {
        self.threshold < 0.0 || weight > self.threshold
    }
}
