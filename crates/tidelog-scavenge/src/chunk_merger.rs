//! Chunk merger phase
//!
//! After execution many chunks are much smaller than a logical chunk. Runs of
//! adjacent completed chunks whose records fit in one logical chunk are
//! copied into a single file covering their whole logical range. Record
//! content and order are unchanged.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use tidelog_core::{ChunkInfo, ChunkManager, RecordForExecutor, ScavengePoint};

use crate::error::Result;
use crate::pool::ReusableSlot;
use crate::scavenger::ScavengeOutcome;
use crate::state::{ScavengeCheckpoint, ScavengeState, StateBackend};

/// Merges small adjacent chunks
pub struct ChunkMerger<'a, L: ?Sized, B: StateBackend> {
    log: &'a L,
    state: &'a ScavengeState<B>,
    record: ReusableSlot<RecordForExecutor>,
}

impl<'a, L: ChunkManager + ?Sized, B: StateBackend> ChunkMerger<'a, L, B> {
    pub fn new(log: &'a L, state: &'a ScavengeState<B>) -> Self {
        Self {
            log,
            state,
            record: ReusableSlot::default(),
        }
    }

    /// Merge chunks after `done_logical_chunk_number`
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point, after = ?done_logical_chunk_number))]
    pub fn merge(
        &self,
        scavenge_point: &ScavengePoint,
        done_logical_chunk_number: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let groups = self.plan(scavenge_point, done_logical_chunk_number)?;
        let mut merged = 0usize;

        for group in groups {
            if cancel.is_cancelled() {
                info!(merged, "Chunk merging cancelled");
                return Ok(ScavengeOutcome::Cancelled);
            }

            let Some(last) = group.last() else {
                continue;
            };
            let done = last.chunk_end_number;
            self.merge_group(&group)?;
            merged += 1;

            self.state.begin()?.commit(&ScavengeCheckpoint::MergingChunks {
                scavenge_point: *scavenge_point,
                done_logical_chunk_number: Some(done),
            })?;
        }

        self.state.begin()?.commit(&ScavengeCheckpoint::ExecutingIndex {
            scavenge_point: *scavenge_point,
            last_entry: None,
        })?;
        info!(merged, "Chunk merging complete");
        Ok(ScavengeOutcome::Completed)
    }

    /// Groups of two or more adjacent chunks that fit in one logical chunk
    fn plan(
        &self,
        scavenge_point: &ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    ) -> Result<Vec<Vec<ChunkInfo>>> {
        let chunk_size = self.log.chunk_size();
        let scavenge_point_chunk = scavenge_point.chunk_number(chunk_size);

        let mut groups = Vec::new();
        let mut current: Vec<ChunkInfo> = Vec::new();
        let mut current_size = 0u64;

        for chunk in self.log.chunks()? {
            if !chunk.is_read_only || chunk.chunk_end_number >= scavenge_point_chunk {
                continue;
            }
            if done_logical_chunk_number.is_some_and(|done| chunk.chunk_start_number <= done) {
                continue;
            }

            let adjacent = current
                .last()
                .is_some_and(|last| last.chunk_end_number + 1 == chunk.chunk_start_number);
            if !adjacent || current_size + chunk.physical_data_size > chunk_size {
                if current.len() >= 2 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current_size = 0;
            }
            current_size += chunk.physical_data_size;
            current.push(chunk);
        }
        if current.len() >= 2 {
            groups.push(current);
        }

        Ok(groups)
    }

    fn merge_group(&self, group: &[ChunkInfo]) -> Result<()> {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            return Ok(());
        };

        let mut record = self.record.acquire()?;
        let mut writer = self
            .log
            .create_chunk_writer(first.chunk_start_number, last.chunk_end_number)?;

        let copied: Result<u64> = (|| {
            let mut copied = 0u64;
            for chunk in group {
                let mut reader = self.log.open_chunk(chunk)?;
                while reader.read_next(&mut record)? {
                    writer.write_record(&record)?;
                    copied += 1;
                }
            }
            Ok(copied)
        })();

        match copied {
            Ok(records) => {
                let merged = writer.complete()?;
                debug!(
                    from = first.chunk_start_number,
                    to = last.chunk_end_number,
                    chunks = group.len(),
                    records,
                    size = merged.physical_data_size,
                    "Merged chunks"
                );
                Ok(())
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }
}
