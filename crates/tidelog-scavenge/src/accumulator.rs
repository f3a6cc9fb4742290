//! Accumulator phase
//!
//! One forward pass over the log, from the last accumulated position up to
//! the scavenge point. It registers every stream for collision detection,
//! records metadata and tombstones, and widens per-chunk timestamp ranges.
//! No discard points for original streams are computed here.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tidelog_core::{
    ChunkReader, DiscardPoint, IndexReader, LogPosition, LogRecord, PrepareRecord,
    ScavengePoint, StreamHandle, StreamMetadata, TOMBSTONE_EVENT_NUMBER, chunk_number_of,
    is_metastream, metastream_of, original_stream_of,
};

use crate::config::ScavengeConfig;
use crate::error::{Result, ScavengeError};
use crate::scavenger::ScavengeOutcome;
use crate::state::{
    ScavengeCheckpoint, ScavengeState, ScavengeTransaction, StateBackend, StreamStatus,
};

/// Records fetched from the log per read
const READ_BATCH_SIZE: usize = 1024;

/// Weight added for a record that will certainly be removed
pub(crate) const DEFINITE_WEIGHT: f32 = 2.0;

/// Weight added for a record that may be removed
pub(crate) const MAYBE_WEIGHT: f32 = 1.0;

/// Counters for one accumulation pass
#[derive(Debug, Default, Clone, Copy)]
struct AccumulatorStats {
    records: u64,
    metadata_records: u64,
    tombstones: u64,
    collisions: u64,
}

/// Scans the log and records per-stream and per-chunk facts
pub struct Accumulator<'a, L: ?Sized, B: StateBackend> {
    log: &'a L,
    state: &'a ScavengeState<B>,
    config: &'a ScavengeConfig,
}

impl<'a, L: ChunkReader + IndexReader + ?Sized, B: StateBackend> Accumulator<'a, L, B> {
    pub fn new(log: &'a L, state: &'a ScavengeState<B>, config: &'a ScavengeConfig) -> Self {
        Self { log, state, config }
    }

    /// Accumulate `[from, scavenge_point.position)`
    ///
    /// Commits at every chunk boundary and every `accumulator_commit_every`
    /// records. The final commit moves the checkpoint to calculating.
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point, from = from))]
    pub fn accumulate(
        &self,
        scavenge_point: &ScavengePoint,
        from: LogPosition,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let chunk_size = self.log.chunk_size();
        let until = scavenge_point.position;
        let checkpoint_at = |next_log_position| ScavengeCheckpoint::Accumulating {
            scavenge_point: *scavenge_point,
            next_log_position,
        };

        let mut stats = AccumulatorStats::default();
        let mut next = from;
        let mut current_chunk = chunk_number_of(next, chunk_size);
        let mut uncommitted = 0usize;
        let mut txn = self.state.begin()?;

        while next < until {
            let batch = self.log.read_forward(next, until, READ_BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }

            for item in batch {
                let position = item.record.log_position();

                if cancel.is_cancelled() {
                    txn.commit(&checkpoint_at(next))?;
                    info!(next, records = stats.records, "Accumulation cancelled");
                    return Ok(ScavengeOutcome::Cancelled);
                }

                if item.size > self.config.max_record_size {
                    return Err(ScavengeError::corruption(
                        position,
                        format!(
                            "record of {} bytes exceeds maximum of {}",
                            item.size, self.config.max_record_size
                        ),
                    ));
                }

                let chunk = chunk_number_of(position, chunk_size);
                if chunk != current_chunk {
                    if uncommitted > 0 {
                        txn.commit(&checkpoint_at(position))?;
                        txn = self.state.begin()?;
                        uncommitted = 0;
                    }
                    debug!(chunk, "Accumulating chunk");
                    current_chunk = chunk;
                }

                self.process_record(&mut txn, &item.record, scavenge_point, &mut stats)?;
                stats.records += 1;
                uncommitted += 1;
                next = position + 1;

                if uncommitted >= self.config.accumulator_commit_every {
                    txn.commit(&checkpoint_at(next))?;
                    txn = self.state.begin()?;
                    uncommitted = 0;
                }
            }
        }

        txn.commit(&ScavengeCheckpoint::Calculating {
            scavenge_point: *scavenge_point,
            done_stream_handle: StreamHandle::None,
        })?;

        info!(
            records = stats.records,
            metadata = stats.metadata_records,
            tombstones = stats.tombstones,
            collisions = stats.collisions,
            "Accumulation complete"
        );
        Ok(ScavengeOutcome::Completed)
    }

    fn process_record(
        &self,
        txn: &mut ScavengeTransaction<'_, B>,
        record: &LogRecord,
        scavenge_point: &ScavengePoint,
        stats: &mut AccumulatorStats,
    ) -> Result<()> {
        let chunk_size = self.log.chunk_size();
        let chunk = chunk_number_of(record.log_position(), chunk_size);
        txn.extend_chunk_time_stamp_range(chunk, record.timestamp())?;

        let LogRecord::Prepare(prepare) = record else {
            return Ok(());
        };

        if txn.detect_collisions(&prepare.stream_id)?.is_some() {
            stats.collisions += 1;
        }

        if is_metastream(&prepare.stream_id) {
            if prepare.is_metadata() {
                stats.metadata_records += 1;
                self.accumulate_metadata(txn, prepare, scavenge_point, chunk_size)?;
            }
        } else if prepare.is_tombstone() {
            stats.tombstones += 1;
            self.accumulate_tombstone(txn, prepare, chunk_size)?;
        }
        Ok(())
    }

    fn accumulate_metadata(
        &self,
        txn: &mut ScavengeTransaction<'_, B>,
        prepare: &PrepareRecord,
        scavenge_point: &ScavengePoint,
        chunk_size: u64,
    ) -> Result<()> {
        let original = original_stream_of(&prepare.stream_id);
        txn.detect_collisions(original)?;

        let meta_handle = txn.handle_for(&prepare.stream_id)?;
        let meta_row = txn.metastream(&meta_handle)?;
        let original_handle = txn.handle_for(original)?;
        let data_row = txn.original_stream(&original_handle)?;

        // The cleaner drops the rows of spent tombstoned streams, so a missing
        // row says nothing. The index still ends at the tombstone.
        let deleted_earlier = (meta_row.is_none() || data_row.is_none())
            && self.log.last_event_number(
                &StreamHandle::for_id(original),
                scavenge_point.position,
            )? == Some(TOMBSTONE_EVENT_NUMBER);

        let mut meta = meta_row.unwrap_or_default();
        let mut data = data_row.unwrap_or_default();
        if deleted_earlier {
            debug!(stream = original, "Metadata for a stream deleted in an earlier run");
            data.is_tombstoned = true;
        }

        // The previous metadata record is now superseded
        if let Some(previous) = meta.last_metadata_position {
            txn.add_chunk_weight(chunk_number_of(previous, chunk_size), DEFINITE_WEIGHT)?;
        }

        if meta.is_tombstoned || data.is_tombstoned {
            meta.is_tombstoned = true;
            txn.add_chunk_weight(
                chunk_number_of(prepare.log_position, chunk_size),
                DEFINITE_WEIGHT,
            )?;
        }

        meta.discard_point = meta
            .discard_point
            .or(DiscardPoint::discard_before(prepare.event_number));
        meta.last_metadata_position = Some(prepare.log_position);
        txn.set_metastream(&meta_handle, &meta)?;

        let metadata = StreamMetadata::from_json(&prepare.data).unwrap_or_else(|e| {
            warn!(
                stream = original,
                position = prepare.log_position,
                error = %e,
                "Unparsable stream metadata, treating as empty"
            );
            StreamMetadata::EMPTY
        });
        data.set_metadata(&metadata);
        if !data.is_tombstoned {
            data.status = StreamStatus::Active;
        }
        txn.set_original_stream(&original_handle, &data)?;

        debug!(stream = original, ?metadata, "Accumulated metadata");
        Ok(())
    }

    fn accumulate_tombstone(
        &self,
        txn: &mut ScavengeTransaction<'_, B>,
        prepare: &PrepareRecord,
        chunk_size: u64,
    ) -> Result<()> {
        let handle = txn.handle_for(&prepare.stream_id)?;
        let mut data = txn.original_stream(&handle)?.unwrap_or_default();
        data.is_tombstoned = true;
        data.status = StreamStatus::Active;
        txn.set_original_stream(&handle, &data)?;

        let metastream = metastream_of(&prepare.stream_id);
        txn.detect_collisions(&metastream)?;
        let meta_handle = txn.handle_for(&metastream)?;
        if let Some(mut meta) = txn.metastream(&meta_handle)? {
            meta.is_tombstoned = true;
            if let Some(position) = meta.last_metadata_position {
                txn.add_chunk_weight(chunk_number_of(position, chunk_size), DEFINITE_WEIGHT)?;
            }
            txn.set_metastream(&meta_handle, &meta)?;
        }

        debug!(stream = %prepare.stream_id, "Accumulated tombstone");
        Ok(())
    }
}
