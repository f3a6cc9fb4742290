//! Index executor phase
//!
//! Pages through the index and removes entries for events that the chunk
//! executor has discarded, or will discard, on firm evidence: a tombstone or
//! a discard point. Maybe discard points are never applied here, so an entry
//! may outlive its event but an event never loses its entry.
//!
//! Entries are keyed by hash. While a hash has a single user the entry maps
//! straight to that stream's row. For collided hashes the stream is read back
//! from the log; an entry whose record is already gone is dangling and is
//! removed.
//!
//! Cancellation is checked before every entry. The checkpoint then names the
//! last entry handled, and the removals decided up to it are applied first.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use tidelog_core::{
    ChunkReader, IndexEntry, IndexScavenger, ScavengePoint, StreamHandle, is_metastream,
};

use crate::config::ScavengeConfig;
use crate::error::Result;
use crate::scavenger::ScavengeOutcome;
use crate::state::{IndexExecutionInfo, ScavengeCheckpoint, ScavengeState, StateBackend};

/// What the executor knows about the hash of the previous entry
struct HashLookup {
    hash: u64,
    /// `None` when the hash is collided and entries need a log read
    info: Option<Option<IndexExecutionInfo>>,
}

/// Prunes the index
pub struct IndexExecutor<'a, L: ?Sized, B: StateBackend> {
    log: &'a L,
    state: &'a ScavengeState<B>,
    config: &'a ScavengeConfig,
}

impl<'a, L: ChunkReader + IndexScavenger + ?Sized, B: StateBackend> IndexExecutor<'a, L, B> {
    pub fn new(log: &'a L, state: &'a ScavengeState<B>, config: &'a ScavengeConfig) -> Self {
        Self { log, state, config }
    }

    /// Prune every entry after `last_entry`
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point))]
    pub fn execute(
        &self,
        scavenge_point: &ScavengePoint,
        last_entry: Option<IndexEntry>,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let mut after = last_entry;
        let mut lookup: Option<HashLookup> = None;
        let (mut scanned, mut removed) = (0usize, 0usize);

        loop {
            if cancel.is_cancelled() {
                info!(scanned, removed, "Index execution cancelled");
                return Ok(ScavengeOutcome::Cancelled);
            }

            let page = self
                .log
                .index_entries(after.as_ref(), self.config.calculator_buffer_size)?;
            if page.is_empty() {
                break;
            }

            let mut doomed = Vec::new();
            let mut handled = None;
            let mut stopped = false;
            for entry in &page {
                if cancel.is_cancelled() {
                    stopped = true;
                    break;
                }
                if entry.log_position < scavenge_point.position
                    && self.should_remove(entry, &mut lookup)?
                {
                    doomed.push(*entry);
                }
                handled = Some(*entry);
                scanned += 1;
            }

            removed += self.log.remove_index_entries(&doomed)?;
            if let Some(last) = handled {
                self.state.begin()?.commit(&ScavengeCheckpoint::ExecutingIndex {
                    scavenge_point: *scavenge_point,
                    last_entry: Some(last),
                })?;
                after = Some(last);
            }
            if stopped {
                info!(scanned, removed, last_entry = ?after, "Index execution cancelled");
                return Ok(ScavengeOutcome::Cancelled);
            }
            trace!(scanned, removed, "Index page executed");
        }

        self.state.begin()?.commit(&ScavengeCheckpoint::Cleaning {
            scavenge_point: *scavenge_point,
        })?;
        info!(scanned, removed, "Index execution complete");
        Ok(ScavengeOutcome::Completed)
    }

    fn should_remove(&self, entry: &IndexEntry, lookup: &mut Option<HashLookup>) -> Result<bool> {
        let hash_info = match lookup {
            Some(cached) if cached.hash == entry.stream_hash => cached.info,
            _ => {
                let info = self.lookup_hash(entry.stream_hash)?;
                *lookup = Some(HashLookup {
                    hash: entry.stream_hash,
                    info,
                });
                info
            }
        };

        let info = match hash_info {
            Some(info) => info,
            None => match self.log.stream_id_at(entry.log_position)? {
                Some(stream_id) => {
                    self.info_for(&stream_id, StreamHandle::for_id(stream_id.as_str()))?
                }
                None => {
                    debug!(
                        position = entry.log_position,
                        event_number = entry.event_number,
                        "Removing dangling index entry"
                    );
                    return Ok(true);
                }
            },
        };

        Ok(info.is_some_and(|info| info.should_discard(entry.event_number)))
    }

    /// Execution info shared by every entry of an uncollided hash
    fn lookup_hash(&self, hash: u64) -> Result<Option<Option<IndexExecutionInfo>>> {
        let Some(first_user) = self.state.hash_user(hash)? else {
            // Nothing before the scavenge point used this hash
            return Ok(Some(None));
        };
        if self.state.is_collision(&first_user)? {
            return Ok(None);
        }
        Ok(Some(self.info_for(&first_user, StreamHandle::for_hash(hash))?))
    }

    fn info_for(
        &self,
        stream_id: &str,
        handle: StreamHandle,
    ) -> Result<Option<IndexExecutionInfo>> {
        if is_metastream(stream_id) {
            Ok(self
                .state
                .metastream(&handle)?
                .map(|m| m.index_execution_info()))
        } else {
            Ok(self
                .state
                .original_stream(&handle)?
                .map(|o| o.index_execution_info()))
        }
    }
}
