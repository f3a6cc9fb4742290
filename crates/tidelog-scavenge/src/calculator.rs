//! Calculator phase
//!
//! Walks the original stream rows in handle order and turns the accumulated
//! policies into discard points. Precise policies (max count, truncate
//! before, exact timestamps) move the firm discard point; chunk timestamp
//! ranges can only move the maybe discard point, which the chunk executor
//! confirms per record. Every newly discardable event adds weight to its
//! chunk.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use tidelog_core::{
    DiscardPoint, IndexReader, ScavengePoint, StreamHandle, TOMBSTONE_EVENT_NUMBER,
    chunk_number_of,
};

use crate::accumulator::{DEFINITE_WEIGHT, MAYBE_WEIGHT};
use crate::config::ScavengeConfig;
use crate::error::Result;
use crate::scavenger::ScavengeOutcome;
use crate::state::{
    OriginalStreamData, ScavengeCheckpoint, ScavengeState, ScavengeTransaction, StateBackend,
    StreamStatus, age_cutoff,
};

/// How sure we are that an event is older than the cutoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Age {
    Expired,
    MaybeExpired,
    Live,
}

/// Computes discard points and chunk weights
pub struct Calculator<'a, L: ?Sized, B: StateBackend> {
    log: &'a L,
    state: &'a ScavengeState<B>,
    config: &'a ScavengeConfig,
    chunk_size: u64,
}

impl<'a, L: IndexReader + ?Sized, B: StateBackend> Calculator<'a, L, B> {
    pub fn new(
        log: &'a L,
        state: &'a ScavengeState<B>,
        config: &'a ScavengeConfig,
        chunk_size: u64,
    ) -> Self {
        Self {
            log,
            state,
            config,
            chunk_size,
        }
    }

    /// Calculate every stream after `done_stream_handle`
    #[instrument(skip_all, fields(scavenge_point = %scavenge_point, after = %done_stream_handle))]
    pub fn calculate(
        &self,
        scavenge_point: &ScavengePoint,
        done_stream_handle: &StreamHandle,
        cancel: &CancellationToken,
    ) -> Result<ScavengeOutcome> {
        let checkpoint_at = |done_stream_handle: &StreamHandle| ScavengeCheckpoint::Calculating {
            scavenge_point: *scavenge_point,
            done_stream_handle: done_stream_handle.clone(),
        };

        let mut after = done_stream_handle.clone();
        let mut calculated = 0u64;

        loop {
            let page = self
                .state
                .original_streams_after(&after, self.config.calculator_batch_size)?;
            if page.is_empty() {
                break;
            }

            let mut txn = self.state.begin()?;
            for (handle, data) in page {
                if cancel.is_cancelled() {
                    txn.commit(&checkpoint_at(&after))?;
                    info!(done = %after, calculated, "Calculation cancelled");
                    return Ok(ScavengeOutcome::Cancelled);
                }

                if data.status == StreamStatus::Active {
                    self.calculate_stream(&mut txn, &handle, data, scavenge_point)?;
                    calculated += 1;
                }
                after = handle;
            }
            txn.commit(&checkpoint_at(&after))?;
        }

        self.state.begin()?.commit(&ScavengeCheckpoint::ExecutingChunks {
            scavenge_point: *scavenge_point,
            done_logical_chunk_number: None,
        })?;

        info!(calculated, "Calculation complete");
        Ok(ScavengeOutcome::Completed)
    }

    fn calculate_stream(
        &self,
        txn: &mut ScavengeTransaction<'_, B>,
        handle: &StreamHandle,
        mut data: OriginalStreamData,
        scavenge_point: &ScavengePoint,
    ) -> Result<()> {
        let last = self
            .log
            .last_event_number(handle, scavenge_point.position)?;

        if data.is_tombstoned || last == Some(TOMBSTONE_EVENT_NUMBER) {
            self.add_weights(
                txn,
                handle,
                data.discard_point.first_event_number_to_keep(),
                TOMBSTONE_EVENT_NUMBER,
                DEFINITE_WEIGHT,
                scavenge_point,
            )?;
            data.is_tombstoned = true;
            data.discard_point = DiscardPoint::DISCARD_ALL;
            data.maybe_discard_point = DiscardPoint::DISCARD_ALL;
            data.status = StreamStatus::Spent;
            debug!(stream = %handle, "Stream tombstoned");
            return txn.set_original_stream(handle, &data);
        }

        let Some(last) = last else {
            if !data.metadata().has_discard_policy() {
                data.status = StreamStatus::Archived;
            }
            return txn.set_original_stream(handle, &data);
        };

        let mut discard_point = DiscardPoint::KEEP_ALL;
        if let Some(truncate_before) = data.truncate_before {
            discard_point = discard_point.or(DiscardPoint::discard_before(truncate_before));
        }
        if let Some(max_count) = data.max_count {
            let first_kept = (last + 1).saturating_sub(max_count);
            discard_point = discard_point.or(DiscardPoint::discard_before(first_kept));
        }

        let mut maybe_discard_point = discard_point;
        if let Some(max_age) = data.max_age
            && let Some(cutoff) = age_cutoff(scavenge_point.effective_now, max_age)
        {
            let (firm, maybe) =
                self.max_age_discard_points(txn, handle, discard_point, last, cutoff, scavenge_point)?;
            discard_point = discard_point.or(firm);
            maybe_discard_point = maybe_discard_point.or(maybe);
        }

        // The last event keeps the stream's version
        let cap = DiscardPoint::discard_before(last);
        discard_point = discard_point.min(cap);
        maybe_discard_point = maybe_discard_point.min(cap);

        let old_discard_point = data.discard_point;
        let old_maybe_discard_point = data.maybe_discard_point;
        let new_discard_point = old_discard_point.or(discard_point);
        let new_maybe_discard_point = old_maybe_discard_point
            .or(maybe_discard_point)
            .or(new_discard_point);

        self.add_weights(
            txn,
            handle,
            old_discard_point.first_event_number_to_keep(),
            new_discard_point.first_event_number_to_keep(),
            DEFINITE_WEIGHT,
            scavenge_point,
        )?;
        self.add_weights(
            txn,
            handle,
            old_maybe_discard_point
                .or(new_discard_point)
                .first_event_number_to_keep(),
            new_maybe_discard_point.first_event_number_to_keep(),
            MAYBE_WEIGHT,
            scavenge_point,
        )?;

        data.discard_point = new_discard_point;
        data.maybe_discard_point = new_maybe_discard_point;
        data.status = Self::status_after(&data);

        trace!(
            stream = %handle,
            last,
            discard_point = %new_discard_point,
            maybe_discard_point = %new_maybe_discard_point,
            status = ?data.status,
            "Calculated stream"
        );
        txn.set_original_stream(handle, &data)
    }

    /// Status once discard points are up to date
    fn status_after(data: &OriginalStreamData) -> StreamStatus {
        match (data.max_age, data.max_count, data.truncate_before) {
            (None, None, None) => StreamStatus::Archived,
            (None, None, Some(truncate_before))
                if data.discard_point.first_event_number_to_keep() >= truncate_before =>
            {
                StreamStatus::Archived
            }
            _ => StreamStatus::Active,
        }
    }

    /// Walk events from `start` while they are older than `cutoff`
    ///
    /// Exact timestamps move the firm point while every earlier event was
    /// also certainly expired. Chunk timestamp ranges can only make an event
    /// a maybe. The walk stops at the first live event or at `last`.
    fn max_age_discard_points(
        &self,
        txn: &ScavengeTransaction<'_, B>,
        handle: &StreamHandle,
        start: DiscardPoint,
        last: u64,
        cutoff: DateTime<Utc>,
        scavenge_point: &ScavengePoint,
    ) -> Result<(DiscardPoint, DiscardPoint)> {
        let mut firm = start.first_event_number_to_keep();
        let mut maybe = firm;
        let mut from = firm;

        'walk: while from <= last {
            let events = self.log.read_event_infos_forward(
                handle,
                from,
                self.config.calculator_buffer_size,
                scavenge_point.position,
            )?;
            let Some(tail) = events.last() else {
                break;
            };
            from = tail.event_number.saturating_add(1);

            for event in &events {
                if event.event_number > last {
                    break 'walk;
                }

                let age = match event.timestamp {
                    Some(timestamp) if timestamp < cutoff => Age::Expired,
                    Some(_) => Age::Live,
                    None => match txn.chunk_time_stamp_range(chunk_number_of(
                        event.log_position,
                        self.chunk_size,
                    ))? {
                        Some(range) if range.max < cutoff => Age::Expired,
                        Some(range) if range.min < cutoff => Age::MaybeExpired,
                        _ => Age::Live,
                    },
                };

                match age {
                    Age::Expired if firm == maybe => {
                        firm = event.event_number + 1;
                        maybe = firm;
                    }
                    Age::Expired | Age::MaybeExpired => maybe = event.event_number + 1,
                    Age::Live => break 'walk,
                }
            }
        }

        Ok((
            DiscardPoint::discard_before(firm),
            DiscardPoint::discard_before(maybe),
        ))
    }

    /// Add `weight` to the chunk of every event in `[from, to)`
    fn add_weights(
        &self,
        txn: &mut ScavengeTransaction<'_, B>,
        handle: &StreamHandle,
        from: u64,
        to: u64,
        weight: f32,
        scavenge_point: &ScavengePoint,
    ) -> Result<()> {
        let mut from = from;
        while from < to {
            let events = self.log.read_event_infos_forward(
                handle,
                from,
                self.config.calculator_buffer_size,
                scavenge_point.position,
            )?;
            let Some(tail) = events.last() else {
                break;
            };
            from = tail.event_number.saturating_add(1);

            for event in events.iter().take_while(|e| e.event_number < to) {
                txn.add_chunk_weight(chunk_number_of(event.log_position, self.chunk_size), weight)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tempfile::TempDir;
    use tidelog_core::{Blake3StreamHasher, StreamHasher, StreamMetadata};
    use tidelog_storage::{FileLog, FileLogConfig};

    use crate::accumulator::Accumulator;
    use crate::state::InMemoryStateBackend;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    struct Fixture {
        _temp: TempDir,
        log: FileLog,
        state: ScavengeState<InMemoryStateBackend>,
        config: ScavengeConfig,
    }

    impl Fixture {
        fn new(index_timestamps: bool) -> Self {
            let temp = TempDir::new().unwrap();
            let hasher: Arc<dyn StreamHasher> = Arc::new(Blake3StreamHasher);
            let mut config = FileLogConfig::with_base_dir(temp.path())
                .with_chunk_size(1024)
                .with_index_timestamps(index_timestamps);
            config.sync_on_write = false;
            let log = FileLog::open(config, hasher.clone()).unwrap();
            Self {
                _temp: temp,
                log,
                state: ScavengeState::new(InMemoryStateBackend::new(), hasher),
                config: ScavengeConfig::default().with_calculator_buffer_size(3),
            }
        }

        /// Accumulate and calculate up to the current end of the log
        fn run(&self, effective_now: DateTime<Utc>) -> ScavengePoint {
            let end = self
                .log
                .read_all()
                .unwrap()
                .last()
                .map_or(0, |r| r.log_position() + 1);
            let point = ScavengePoint {
                position: end,
                event_number: 0,
                effective_now,
                threshold: 0.0,
            };
            let cancel = CancellationToken::new();
            Accumulator::new(&self.log, &self.state, &self.config)
                .accumulate(&point, 0, &cancel)
                .unwrap();
            Calculator::new(&self.log, &self.state, &self.config, 1024)
                .calculate(&point, &StreamHandle::None, &cancel)
                .unwrap();
            point
        }

        fn stream(&self, stream_id: &str) -> OriginalStreamData {
            let handle = self.state.handle_for(stream_id).unwrap();
            self.state.original_stream(&handle).unwrap().unwrap()
        }
    }

    #[test]
    fn test_max_count() {
        let fixture = Fixture::new(false);
        fixture
            .log
            .set_stream_metadata("orders", &StreamMetadata::EMPTY.with_max_count(3), ts(0))
            .unwrap();
        for i in 0..10 {
            fixture
                .log
                .append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
        fixture.run(ts(100));

        let orders = fixture.stream("orders");
        assert_eq!(orders.discard_point, DiscardPoint::discard_before(7));
        assert_eq!(orders.maybe_discard_point, DiscardPoint::discard_before(7));
        assert_eq!(orders.status, StreamStatus::Active);
        let total: f32 = fixture
            .state
            .weighted_chunks()
            .unwrap()
            .iter()
            .map(|(_, w)| w)
            .sum();
        assert_eq!(total, 7.0 * DEFINITE_WEIGHT);
    }

    #[test]
    fn test_truncate_before_never_passes_last_event() {
        let fixture = Fixture::new(false);
        fixture
            .log
            .set_stream_metadata(
                "orders",
                &StreamMetadata::EMPTY.with_truncate_before(50),
                ts(0),
            )
            .unwrap();
        for i in 0..4 {
            fixture
                .log
                .append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
        fixture.run(ts(100));

        let orders = fixture.stream("orders");
        assert_eq!(orders.discard_point, DiscardPoint::discard_before(3));
        assert_eq!(orders.status, StreamStatus::Active);
    }

    #[test]
    fn test_tombstone_discards_all() {
        let fixture = Fixture::new(false);
        for i in 0..3 {
            fixture
                .log
                .append_event("carts", "CartOpened", Bytes::new(), ts(i))
                .unwrap();
        }
        fixture.log.delete_stream("carts", ts(5)).unwrap();
        fixture.run(ts(100));

        let carts = fixture.stream("carts");
        assert!(carts.is_tombstoned);
        assert_eq!(carts.discard_point, DiscardPoint::DISCARD_ALL);
        assert_eq!(carts.status, StreamStatus::Spent);
        assert_eq!(fixture.state.chunk_weight(0).unwrap(), 3.0 * DEFINITE_WEIGHT);
    }

    #[test]
    fn test_stream_without_policy_is_archived() {
        let fixture = Fixture::new(false);
        fixture
            .log
            .set_stream_metadata("plain", &StreamMetadata::EMPTY, ts(0))
            .unwrap();
        fixture
            .log
            .append_event("plain", "Happened", Bytes::new(), ts(1))
            .unwrap();
        fixture.run(ts(100));
        assert_eq!(fixture.stream("plain").status, StreamStatus::Archived);
    }

    #[test]
    fn test_max_age_with_exact_timestamps_is_firm() {
        let fixture = Fixture::new(true);
        fixture
            .log
            .set_stream_metadata(
                "sessions",
                &StreamMetadata::EMPTY.with_max_age(Duration::from_secs(60)),
                ts(0),
            )
            .unwrap();
        for i in 0..5 {
            fixture
                .log
                .append_event("sessions", "Ping", Bytes::new(), ts(i * 30))
                .unwrap();
        }
        // Cutoff at ts(90): events at 0, 30, 60 are expired
        fixture.run(ts(150));

        let sessions = fixture.stream("sessions");
        assert_eq!(sessions.discard_point, DiscardPoint::discard_before(3));
        assert_eq!(sessions.maybe_discard_point, DiscardPoint::discard_before(3));
    }

    #[test]
    fn test_max_age_with_chunk_ranges_is_maybe() {
        let fixture = Fixture::new(false);
        fixture
            .log
            .set_stream_metadata(
                "sessions",
                &StreamMetadata::EMPTY.with_max_age(Duration::from_secs(60)),
                ts(0),
            )
            .unwrap();
        for i in 0..5 {
            fixture
                .log
                .append_event("sessions", "Ping", Bytes::new(), ts(i * 30))
                .unwrap();
        }
        fixture.run(ts(150));

        // Every event shares chunk 0, whose range straddles the cutoff
        let sessions = fixture.stream("sessions");
        assert_eq!(sessions.discard_point, DiscardPoint::KEEP_ALL);
        assert_eq!(sessions.maybe_discard_point, DiscardPoint::discard_before(4));
        assert_eq!(fixture.state.chunk_weight(0).unwrap(), 4.0 * MAYBE_WEIGHT);
    }

    #[test]
    fn test_discard_points_never_move_back() {
        let fixture = Fixture::new(false);
        fixture
            .log
            .set_stream_metadata("orders", &StreamMetadata::EMPTY.with_max_count(2), ts(0))
            .unwrap();
        for i in 0..6 {
            fixture
                .log
                .append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
        fixture.run(ts(100));
        assert_eq!(
            fixture.stream("orders").discard_point,
            DiscardPoint::discard_before(4)
        );

        // A looser policy does not bring events back
        fixture
            .log
            .set_stream_metadata("orders", &StreamMetadata::EMPTY.with_max_count(10), ts(10))
            .unwrap();
        fixture.run(ts(100));
        assert_eq!(
            fixture.stream("orders").discard_point,
            DiscardPoint::discard_before(4)
        );
    }
}
