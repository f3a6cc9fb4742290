//! Chunk executor phase
//!
//! Rewrites every weighted chunk before the scavenge point, keeping only the
//! records that no discard point, confirmed maybe discard point, or
//! tombstone rules out. The kept records go to a replacement chunk that is
//! switched in atomically, so a failure leaves the original chunk in place.
//!
//! Chunks are split into contiguous groups, one per worker thread. Workers
//! report back to the coordinating thread, which owns the state store
//! transaction and commits a checkpoint after each finished chunk. The
//! checkpoint only advances past a chunk once every chunk before it is
//! finished, so resuming never skips work. Workers log under the
//! coordinator's scavenge run context.

use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use tidelog_core::{
    ChunkInfo, ChunkManager, ChunkRecordReader, ChunkWriter, RecordForExecutor, RecordView,
    ScavengePoint,
};
use tidelog_logging::{ScavengeContextGuard, phase_span};

use crate::config::ScavengeConfig;
use crate::error::{Result, ScavengeError};
use crate::pool::{ReusableSlot, SlotPool};
use crate::scavenger::ScavengeOutcome;
use crate::state::{ChunkExecutionInfo, ScavengeCheckpoint, ScavengeState, StateBackend};

/// Phase name used by workers started outside a scavenge run
const EXECUTING_CHUNKS: &str = "executing_chunks";

/// Records kept and dropped from one chunk
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExecutionStats {
    pub kept: u64,
    pub discarded: u64,
}

/// Message from a worker to the coordinator
enum WorkerEvent {
    Executed {
        chunk: ChunkInfo,
        stats: ChunkExecutionStats,
    },
    Failed {
        chunk: ChunkInfo,
        error: ScavengeError,
    },
}

/// A candidate chunk and whether its weight earned a rewrite
#[derive(Debug, Clone, Copy)]
struct Candidate {
    chunk: ChunkInfo,
    selected: bool,
}

/// Rewrites chunks
pub struct ChunkExecutor<'a, L: ?Sized, B: StateBackend> {
    log: &'a L,
    state: &'a ScavengeState<B>,
    config: &'a ScavengeConfig,
}

impl<'a, L: ChunkManager + ?Sized, B: StateBackend> ChunkExecutor<'a, L, B> {
    pub fn new(log: &'a L, state: &'a ScavengeState<B>, config: &'a ScavengeConfig) -> Self {
        Self { log, state, config }
    }

    /// Execute every chunk after `done_logical_chunk_number`
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point, after = ?done_logical_chunk_number))]
    pub fn execute(
        &self,
        scavenge_point: &ScavengePoint,
        done_logical_chunk_number: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let candidates = self.candidates(scavenge_point, done_logical_chunk_number)?;
        let selected: Vec<ChunkInfo> = candidates
            .iter()
            .filter(|c| c.selected)
            .map(|c| c.chunk)
            .collect();

        info!(
            candidates = candidates.len(),
            selected = selected.len(),
            workers = self.config.chunk_executor_threads,
            "Executing chunks"
        );

        if !selected.is_empty() {
            let outcome = self.execute_selected(
                scavenge_point,
                &candidates,
                &selected,
                done_logical_chunk_number,
                cancel,
            )?;
            if outcome == ScavengeOutcome::Cancelled {
                return Ok(outcome);
            }
        }

        self.state.begin()?.commit(&ScavengeCheckpoint::MergingChunks {
            scavenge_point: *scavenge_point,
            done_logical_chunk_number: None,
        })?;
        Ok(ScavengeOutcome::Completed)
    }

    /// Completed chunks before the scavenge point's chunk, after the checkpoint
    fn candidates(
        &self,
        scavenge_point: &ScavengePoint,
        done_logical_chunk_number: Option<u32>,
    ) -> Result<Vec<Candidate>> {
        let scavenge_point_chunk = scavenge_point.chunk_number(self.log.chunk_size());
        let mut candidates = Vec::new();

        for chunk in self.log.chunks()? {
            if !chunk.is_read_only || chunk.chunk_end_number >= scavenge_point_chunk {
                continue;
            }
            if done_logical_chunk_number.is_some_and(|done| chunk.chunk_start_number <= done) {
                continue;
            }

            let weight = self.state.sum_chunk_weights(chunk.logical_chunks())?;
            let selected = self.config.should_execute(weight);
            if !selected {
                debug!(
                    chunk = chunk.chunk_start_number,
                    weight,
                    threshold = self.config.threshold,
                    "Skipping chunk below threshold"
                );
            }
            candidates.push(Candidate { chunk, selected });
        }

        Ok(candidates)
    }

    fn execute_selected(
        &self,
        scavenge_point: &ScavengePoint,
        candidates: &[Candidate],
        selected: &[ChunkInfo],
        done_logical_chunk_number: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let workers = self.config.chunk_executor_threads.clamp(1, selected.len());
        let group_size = selected.len().div_ceil(workers);
        let pool: SlotPool<RecordForExecutor> = SlotPool::new(workers);
        let stop = cancel.child_token();

        let mut progress = Progress::new(candidates, done_logical_chunk_number);
        let mut failure: Option<ScavengeError> = None;
        let context = ScavengeContextGuard::current();
        let context = context.as_ref();

        std::thread::scope(|scope| -> Result<()> {
            let (tx, rx) = mpsc::channel::<WorkerEvent>();

            for (worker, group) in selected.chunks(group_size).enumerate() {
                let slot = pool.slot(worker)?;
                let tx = tx.clone();
                let worker_stop = stop.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("chunk-executor-{worker}"))
                    .spawn_scoped(scope, move || {
                        let _context = context.cloned().map(ScavengeContextGuard::with_data);
                        let phase = context.and_then(|c| c.phase).unwrap_or(EXECUTING_CHUNKS);
                        let _span = phase_span(phase).entered();
                        self.run_worker(worker, group, slot, scavenge_point, &worker_stop, &tx)
                    });
                if let Err(e) = spawned {
                    stop.cancel();
                    return Err(e.into());
                }
            }
            drop(tx);

            for event in rx {
                match event {
                    WorkerEvent::Executed { chunk, stats } => {
                        debug!(
                            chunk = chunk.chunk_start_number,
                            kept = stats.kept,
                            discarded = stats.discarded,
                            "Chunk executed"
                        );
                        let recorded = self.record_executed(scavenge_point, &chunk, &mut progress);
                        if let Err(e) = recorded {
                            stop.cancel();
                            failure.get_or_insert(e);
                        }
                    }
                    WorkerEvent::Failed { chunk, error: e } => {
                        error!(
                            chunk = chunk.chunk_start_number,
                            error = %e,
                            "Chunk execution failed"
                        );
                        stop.cancel();
                        failure.get_or_insert(e);
                    }
                }
            }
            Ok(())
        })?;

        if let Some(e) = failure {
            return Err(e);
        }
        if cancel.is_cancelled() {
            info!(done = ?progress.done, "Chunk execution cancelled");
            return Ok(ScavengeOutcome::Cancelled);
        }
        Ok(ScavengeOutcome::Completed)
    }

    fn run_worker(
        &self,
        worker: usize,
        group: &[ChunkInfo],
        slot: &ReusableSlot<RecordForExecutor>,
        scavenge_point: &ScavengePoint,
        stop: &CancellationToken,
        tx: &mpsc::Sender<WorkerEvent>,
    ) {
        debug!(worker, chunks = group.len(), "Chunk worker started");
        for chunk in group {
            if stop.is_cancelled() {
                break;
            }
            let event = match self.execute_chunk(chunk, slot, scavenge_point, stop) {
                Ok(Some(stats)) => WorkerEvent::Executed {
                    chunk: *chunk,
                    stats,
                },
                Ok(None) => break,
                Err(error) => WorkerEvent::Failed {
                    chunk: *chunk,
                    error,
                },
            };
            let failed = matches!(event, WorkerEvent::Failed { .. });
            if tx.send(event).is_err() || failed {
                break;
            }
        }
    }

    /// Rewrite one chunk; `None` when stopped part way
    fn execute_chunk(
        &self,
        chunk: &ChunkInfo,
        slot: &ReusableSlot<RecordForExecutor>,
        scavenge_point: &ScavengePoint,
        stop: &CancellationToken,
    ) -> Result<Option<ChunkExecutionStats>> {
        let mut record = slot.acquire()?;
        let mut reader = self.log.open_chunk(chunk)?;
        let mut writer = self
            .log
            .create_chunk_writer(chunk.chunk_start_number, chunk.chunk_end_number)?;

        match self.copy_kept(reader.as_mut(), writer.as_mut(), &mut record, scavenge_point, stop) {
            Ok(Some(stats)) => {
                let replacement = writer.complete()?;
                debug!(
                    chunk = chunk.chunk_start_number,
                    old_size = chunk.physical_data_size,
                    new_size = replacement.physical_data_size,
                    "Switched in rewritten chunk"
                );
                Ok(Some(stats))
            }
            Ok(None) => {
                writer.abort();
                Ok(None)
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    fn copy_kept(
        &self,
        reader: &mut dyn ChunkRecordReader,
        writer: &mut dyn ChunkWriter,
        record: &mut RecordForExecutor,
        scavenge_point: &ScavengePoint,
        stop: &CancellationToken,
    ) -> Result<Option<ChunkExecutionStats>> {
        let mut stats = ChunkExecutionStats::default();
        let mut infos: HashMap<String, Option<ChunkExecutionInfo>> = HashMap::new();

        while reader.read_next(record)? {
            if stop.is_cancelled() {
                return Ok(None);
            }

            let keep = match record.view() {
                RecordView::NonPrepare => self.config.retain_non_prepare_records,
                RecordView::Prepare {
                    is_scavengable: false,
                    ..
                } => true,
                RecordView::Prepare {
                    stream_id,
                    event_number,
                    timestamp,
                    ..
                } => {
                    let info = match infos.get(stream_id) {
                        Some(info) => *info,
                        None => {
                            let info = self.state.chunk_execution_info(stream_id)?;
                            infos.insert(stream_id.to_string(), info);
                            info
                        }
                    };
                    info.is_none_or(|info| {
                        !info.should_discard(event_number, timestamp, scavenge_point.effective_now)
                    })
                }
            };

            if keep {
                writer.write_record(record)?;
                stats.kept += 1;
            } else {
                stats.discarded += 1;
            }
        }

        Ok(Some(stats))
    }

    /// Reset the chunk's weights and advance the checkpoint
    fn record_executed(
        &self,
        scavenge_point: &ScavengePoint,
        chunk: &ChunkInfo,
        progress: &mut Progress,
    ) -> Result<()> {
        progress.complete(chunk.chunk_start_number);

        let mut txn = self.state.begin()?;
        for logical_chunk in chunk.logical_chunks() {
            txn.reset_chunk_weight(logical_chunk)?;
        }
        txn.commit(&ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: *scavenge_point,
            done_logical_chunk_number: progress.done,
        })
    }
}

/// Tracks the highest chunk below which every candidate is finished
struct Progress {
    /// (first logical chunk, last logical chunk) of chunks still pending
    pending: Vec<(u32, u32)>,
    finished: BTreeSet<u32>,
    done: Option<u32>,
}

impl Progress {
    fn new(candidates: &[Candidate], done: Option<u32>) -> Self {
        let mut progress = Self {
            pending: candidates
                .iter()
                .rev()
                .map(|c| (c.chunk.chunk_start_number, c.chunk.chunk_end_number))
                .collect(),
            finished: candidates
                .iter()
                .filter(|c| !c.selected)
                .map(|c| c.chunk.chunk_start_number)
                .collect(),
            done,
        };
        progress.advance();
        progress
    }

    fn complete(&mut self, chunk_start_number: u32) {
        self.finished.insert(chunk_start_number);
        self.advance();
    }

    fn advance(&mut self) {
        while let Some(&(start, end)) = self.pending.last() {
            if !self.finished.remove(&start) {
                break;
            }
            self.pending.pop();
            self.done = Some(end);
        }
    }
}
