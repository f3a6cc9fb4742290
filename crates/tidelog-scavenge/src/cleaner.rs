//! Cleaner phase
//!
//! Once every weighted chunk has been rewritten, rows whose streams can
//! never discard anything again are deleted: metastreams of tombstoned
//! streams, spent original streams, and optionally archived ones. The
//! cleaner is the only phase that shrinks the state store. Running it twice
//! deletes nothing the second time.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use tidelog_core::{ScavengePoint, StreamHandle};

use crate::config::ScavengeConfig;
use crate::error::Result;
use crate::scavenger::ScavengeOutcome;
use crate::state::{
    OriginalStreamData, ScavengeCheckpoint, ScavengeState, StateBackend, StreamStatus,
};

/// Deletes rows that are no longer needed
pub struct Cleaner<'a, B: StateBackend> {
    state: &'a ScavengeState<B>,
    config: &'a ScavengeConfig,
}

impl<'a, B: StateBackend> Cleaner<'a, B> {
    pub fn new(state: &'a ScavengeState<B>, config: &'a ScavengeConfig) -> Self {
        Self { state, config }
    }

    /// Clean the state store and finish the run
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point))]
    pub fn clean(
        &self,
        scavenge_point: &ScavengePoint,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        if self.state.all_chunks_executed()? {
            let Some(metastreams) = self.clean_metastreams(scavenge_point, cancel)? else {
                return Ok(ScavengeOutcome::Cancelled);
            };
            let Some(originals) = self.clean_original_streams(scavenge_point, cancel)? else {
                return Ok(ScavengeOutcome::Cancelled);
            };
            info!(metastreams, originals, "Cleaned scavenge state");
        } else {
            info!("Chunks left unexecuted, keeping stream rows");
        }

        self.state.begin()?.commit(&ScavengeCheckpoint::Done {
            scavenge_point: *scavenge_point,
        })?;
        Ok(ScavengeOutcome::Completed)
    }

    fn should_delete(&self, data: &OriginalStreamData) -> bool {
        match data.status {
            StreamStatus::Spent => true,
            StreamStatus::Archived => self.config.clean_archived,
            StreamStatus::Active => false,
        }
    }

    /// Returns the number of rows deleted, or `None` when cancelled
    fn clean_metastreams(
        &self,
        scavenge_point: &ScavengePoint,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let mut after = StreamHandle::None;
        let mut deleted = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .state
                .metastreams_after(&after, self.config.calculator_batch_size)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = last.clone();

            let mut txn = self.state.begin()?;
            for (handle, data) in &page {
                if data.is_tombstoned && txn.delete_metastream(handle)? {
                    deleted += 1;
                }
            }
            txn.commit(&ScavengeCheckpoint::Cleaning {
                scavenge_point: *scavenge_point,
            })?;
        }
        Ok(Some(deleted))
    }

    /// Returns the number of rows deleted, or `None` when cancelled
    fn clean_original_streams(
        &self,
        scavenge_point: &ScavengePoint,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>> {
        let mut after = StreamHandle::None;
        let mut deleted = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .state
                .original_streams_after(&after, self.config.calculator_batch_size)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = last.clone();

            let mut txn = self.state.begin()?;
            for (handle, data) in &page {
                if self.should_delete(data) && txn.delete_original_stream(handle)? {
                    deleted += 1;
                }
            }
            txn.commit(&ScavengeCheckpoint::Cleaning {
                scavenge_point: *scavenge_point,
            })?;
        }
        Ok(Some(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::DateTime;
    use tidelog_core::{Blake3StreamHasher, DiscardPoint};

    use crate::state::{InMemoryStateBackend, MetastreamData};

    fn point() -> ScavengePoint {
        ScavengePoint {
            position: 100,
            event_number: 1,
            effective_now: DateTime::UNIX_EPOCH,
            threshold: 0.0,
        }
    }

    fn seeded_state() -> ScavengeState<InMemoryStateBackend> {
        let state = ScavengeState::new(InMemoryStateBackend::new(), Arc::new(Blake3StreamHasher));
        let mut txn = state.begin().unwrap();
        for (stream, status) in [
            ("spent", StreamStatus::Spent),
            ("archived", StreamStatus::Archived),
            ("active", StreamStatus::Active),
        ] {
            txn.detect_collisions(stream).unwrap();
            let handle = txn.handle_for(stream).unwrap();
            let data = OriginalStreamData {
                status,
                ..Default::default()
            };
            txn.set_original_stream(&handle, &data).unwrap();
        }
        for (stream, is_tombstoned) in [("$$spent", true), ("$$active", false)] {
            txn.detect_collisions(stream).unwrap();
            let handle = txn.handle_for(stream).unwrap();
            let data = MetastreamData {
                is_tombstoned,
                discard_point: DiscardPoint::discard_before(1),
                last_metadata_position: Some(10),
            };
            txn.set_metastream(&handle, &data).unwrap();
        }
        txn.commit(&ScavengeCheckpoint::Cleaning {
            scavenge_point: point(),
        })
        .unwrap();
        state
    }

    fn row_exists(state: &ScavengeState<InMemoryStateBackend>, stream: &str) -> bool {
        let handle = state.handle_for(stream).unwrap();
        if stream.starts_with("$$") {
            state.metastream(&handle).unwrap().is_some()
        } else {
            state.original_stream(&handle).unwrap().is_some()
        }
    }

    #[test]
    fn test_cleans_spent_rows() {
        let state = seeded_state();
        let config = ScavengeConfig::default();
        let cleaner = Cleaner::new(&state, &config);

        let outcome = cleaner.clean(&point(), &CancellationToken::new()).unwrap();
        assert_eq!(outcome, ScavengeOutcome::Completed);
        assert!(!row_exists(&state, "spent"));
        assert!(!row_exists(&state, "$$spent"));
        assert!(row_exists(&state, "archived"));
        assert!(row_exists(&state, "active"));
        assert!(row_exists(&state, "$$active"));
        assert!(state.checkpoint().unwrap().unwrap().is_done());

        // Second pass finds nothing more to delete
        cleaner.clean(&point(), &CancellationToken::new()).unwrap();
        assert!(row_exists(&state, "archived"));
        assert!(row_exists(&state, "active"));
    }

    #[test]
    fn test_cleans_archived_when_configured() {
        let state = seeded_state();
        let config = ScavengeConfig::default().with_clean_archived(true);
        Cleaner::new(&state, &config)
            .clean(&point(), &CancellationToken::new())
            .unwrap();
        assert!(!row_exists(&state, "archived"));
        assert!(row_exists(&state, "active"));
    }

    #[test]
    fn test_keeps_rows_while_chunks_unexecuted() {
        let state = seeded_state();
        let mut txn = state.begin().unwrap();
        txn.add_chunk_weight(0, 2.0).unwrap();
        txn.commit(&ScavengeCheckpoint::Cleaning {
            scavenge_point: point(),
        })
        .unwrap();

        let config = ScavengeConfig::default();
        Cleaner::new(&state, &config)
            .clean(&point(), &CancellationToken::new())
            .unwrap();
        assert!(row_exists(&state, "spent"));
        assert!(row_exists(&state, "$$spent"));
    }
}
