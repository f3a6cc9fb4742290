//! Scavenge orchestrator
//!
//! [`Scavenger`] drives a run through its phases:
//!
//! ```text
//! Accumulating -> Calculating -> ExecutingChunks -> MergingChunks
//!     -> ExecutingIndex -> Cleaning -> Done
//! ```
//!
//! Every phase commits the checkpoint of the next phase together with its
//! last unit of work, so the orchestrator only ever reads the persisted
//! checkpoint to decide what to do next. A run that stops for any reason
//! resumes from that checkpoint. `Done` stays put until a newer scavenge
//! point is available or requested.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use tidelog_core::{ChunkManager, IndexReader, IndexScavenger, LogPosition, ScavengePointSource};
use tidelog_logging::{ScavengeContextGuard, phase_span};

use crate::accumulator::Accumulator;
use crate::calculator::Calculator;
use crate::chunk_executor::ChunkExecutor;
use crate::chunk_merger::ChunkMerger;
use crate::cleaner::Cleaner;
use crate::config::ScavengeConfig;
use crate::error::{Result, ScavengeError};
use crate::index_executor::IndexExecutor;
use crate::state::{ScavengeCheckpoint, ScavengeState, StateBackend};

/// Everything the scavenger needs from the database
pub trait ScavengeLog: ChunkManager + IndexReader + IndexScavenger + ScavengePointSource {}

impl<T> ScavengeLog for T where
    T: ChunkManager + IndexReader + IndexScavenger + ScavengePointSource + ?Sized
{
}

/// How a call to [`Scavenger::run`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScavengeOutcome {
    /// The run reached `Done`
    Completed,
    /// The run stopped at a committed checkpoint and can be resumed
    Cancelled,
}

/// Runs and resumes scavenges
pub struct Scavenger<L: ?Sized, B: StateBackend> {
    log: Arc<L>,
    state: ScavengeState<B>,
    config: ScavengeConfig,
}

impl<L: ScavengeLog + ?Sized, B: StateBackend> Scavenger<L, B> {
    pub fn new(log: Arc<L>, state: ScavengeState<B>, config: ScavengeConfig) -> Self {
        Self { log, state, config }
    }

    /// The scavenge state store
    pub fn state(&self) -> &ScavengeState<B> {
        &self.state
    }

    /// The configuration
    pub fn config(&self) -> &ScavengeConfig {
        &self.config
    }

    /// Persisted checkpoint, for diagnostics
    pub fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>> {
        self.state.checkpoint()
    }

    /// Run or resume a scavenge until it is done or `cancel` fires
    ///
    /// Starts a new run when there is no checkpoint or the last run is done.
    pub fn run(&self, cancel: &CancellationToken) -> Result<ScavengeOutcome> {
        let mut checkpoint = match self.state.checkpoint()? {
            Some(checkpoint) if !checkpoint.is_done() => {
                info!(%checkpoint, "Resuming scavenge");
                checkpoint
            }
            previous => self.start_run(previous.as_ref())?,
        };

        let scavenge_point = *checkpoint.scavenge_point();
        let _context = ScavengeContextGuard::new(scavenge_point.event_number);
        let span = info_span!("scavenge", scavenge_point = %scavenge_point);
        let _entered = span.enter();

        // The scavenge point's threshold governs the whole run
        let config = self.config.clone().with_threshold(scavenge_point.threshold);

        loop {
            if checkpoint.is_done() {
                info!("Scavenge complete");
                return Ok(ScavengeOutcome::Completed);
            }

            let phase = checkpoint.phase();
            let outcome = {
                let _phase = ScavengeContextGuard::enter_phase(phase);
                let _span = phase_span(phase).entered();
                self.run_phase(&checkpoint, &config, cancel)?
            };
            if outcome == ScavengeOutcome::Cancelled {
                info!(phase, "Scavenge cancelled");
                return Ok(ScavengeOutcome::Cancelled);
            }

            let next = self
                .state
                .checkpoint()?
                .ok_or_else(|| ScavengeError::invariant("checkpoint missing after phase"))?;
            if next.phase() == phase || next.scavenge_point() != &scavenge_point {
                return Err(ScavengeError::invariant(format!(
                    "phase {phase} completed but checkpoint is {next}"
                )));
            }
            checkpoint = next;
        }
    }

    fn run_phase(
        &self,
        checkpoint: &ScavengeCheckpoint,
        config: &ScavengeConfig,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let log = self.log.as_ref();
        let state = &self.state;

        match checkpoint {
            ScavengeCheckpoint::Accumulating {
                scavenge_point,
                next_log_position,
            } => Accumulator::new(log, state, config).accumulate(
                scavenge_point,
                *next_log_position,
                cancel,
            ),
            ScavengeCheckpoint::Calculating {
                scavenge_point,
                done_stream_handle,
            } => Calculator::new(log, state, config, log.chunk_size()).calculate(
                scavenge_point,
                done_stream_handle,
                cancel,
            ),
            ScavengeCheckpoint::ExecutingChunks {
                scavenge_point,
                done_logical_chunk_number,
            } => ChunkExecutor::new(log, state, config).execute(
                scavenge_point,
                *done_logical_chunk_number,
                cancel,
            ),
            ScavengeCheckpoint::MergingChunks {
                scavenge_point,
                done_logical_chunk_number,
            } => {
                if config.merge_chunks {
                    ChunkMerger::new(log, state).merge(
                        scavenge_point,
                        *done_logical_chunk_number,
                        cancel,
                    )
                } else {
                    state.begin()?.commit(&ScavengeCheckpoint::ExecutingIndex {
                        scavenge_point: *scavenge_point,
                        last_entry: None,
                    })?;
                    Ok(ScavengeOutcome::Completed)
                }
            }
            ScavengeCheckpoint::ExecutingIndex {
                scavenge_point,
                last_entry,
            } => IndexExecutor::new(log, state, config).execute(
                scavenge_point,
                *last_entry,
                cancel,
            ),
            ScavengeCheckpoint::Cleaning { scavenge_point } => {
                Cleaner::new(state, config).clean(scavenge_point, cancel)
            }
            ScavengeCheckpoint::Done { .. } => Ok(ScavengeOutcome::Completed),
        }
    }

    /// Pick the scavenge point for a new run and persist its first checkpoint
    fn start_run(&self, previous: Option<&ScavengeCheckpoint>) -> Result<ScavengeCheckpoint> {
        let previous_point = previous.map(|c| *c.scavenge_point());

        let scavenge_point = match self.log.latest_scavenge_point()? {
            Some(latest)
                if previous_point.is_none_or(|previous| latest.position > previous.position) =>
            {
                info!(scavenge_point = %latest, "Using existing scavenge point");
                latest
            }
            _ => {
                let added = self
                    .log
                    .add_scavenge_point(Utc::now(), self.config.threshold)?;
                info!(scavenge_point = %added, "Added scavenge point");
                added
            }
        };

        let from: LogPosition = previous_point.map_or(0, |previous| previous.position);
        if let Some(previous) = previous_point
            && scavenge_point.effective_now < previous.effective_now
        {
            warn!(
                previous = %previous.effective_now,
                current = %scavenge_point.effective_now,
                "Scavenge point clock went backwards"
            );
        }

        let checkpoint = ScavengeCheckpoint::Accumulating {
            scavenge_point,
            next_log_position: from,
        };
        self.state.begin()?.commit(&checkpoint)?;
        info!(from, "Starting scavenge");
        Ok(checkpoint)
    }
}

