//! Scavenge state store
//!
//! [`ScavengeState`] is the typed view over a [`StateBackend`]. It owns the
//! key encodings, the value serialization (postcard) and collision detection.
//!
//! Reads made directly on [`ScavengeState`] see committed data only; they are
//! what the chunk executor's workers use while the coordinator commits. All
//! writes, and reads that must see them, go through a [`ScavengeTransaction`]
//! guard obtained from [`ScavengeState::begin`]. A guard that is dropped
//! without [`ScavengeTransaction::commit`] rolls back.

pub mod backend;
pub mod data;
pub mod memory;
pub mod redb;

pub use backend::{ReadView, ScanResults, StateBackend, StateTable};
pub use data::{
    ChunkExecutionInfo, ChunkTimeStampRange, IndexExecutionInfo, MetastreamData,
    OriginalStreamData, ScavengeCheckpoint, StreamStatus, age_cutoff,
};
pub use memory::InMemoryStateBackend;
pub use redb::{RedbStateBackend, RedbStateConfig};

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use tidelog_core::{StreamHandle, StreamHasher, is_metastream};

use crate::error::{Result, ScavengeError};

const CHECKPOINT_KEY: &[u8] = b"checkpoint";

fn chunk_key(logical_chunk_number: u32) -> [u8; 4] {
    logical_chunk_number.to_be_bytes()
}

fn decode_chunk_key(key: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = key
        .try_into()
        .map_err(|_| ScavengeError::state(format!("bad chunk key of {} bytes", key.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn decode_handle(key: &[u8]) -> Result<StreamHandle> {
    StreamHandle::from_key(key).ok_or_else(|| ScavengeError::state("bad stream handle key"))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(postcard::from_bytes(bytes)?)
}

fn decode_weight(bytes: &[u8]) -> Result<f32> {
    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| ScavengeError::state("bad chunk weight"))?;
    Ok(f32::from_le_bytes(bytes))
}

/// Typed scavenge state over a backend
pub struct ScavengeState<B: StateBackend> {
    backend: B,
    hasher: Arc<dyn StreamHasher>,
}

impl<B: StateBackend> ScavengeState<B> {
    /// Wrap a backend; `hasher` must be the one the index uses
    pub fn new(backend: B, hasher: Arc<dyn StreamHasher>) -> Self {
        Self { backend, hasher }
    }

    /// The underlying backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The stream hasher
    pub fn hasher(&self) -> &dyn StreamHasher {
        self.hasher.as_ref()
    }

    /// Open a transaction
    ///
    /// Fails with an invariant violation if one is already open.
    pub fn begin(&self) -> Result<ScavengeTransaction<'_, B>> {
        self.backend.begin()?;
        Ok(ScavengeTransaction {
            state: self,
            open: true,
        })
    }

    fn get_value<T: DeserializeOwned>(
        &self,
        table: StateTable,
        key: &[u8],
        view: ReadView,
    ) -> Result<Option<T>> {
        self.backend
            .get(table, key, view)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn is_collision_in(&self, stream_id: &str, view: ReadView) -> Result<bool> {
        Ok(self
            .backend
            .get(StateTable::Collisions, stream_id.as_bytes(), view)?
            .is_some())
    }

    fn handle_in(&self, stream_id: &str, view: ReadView) -> Result<StreamHandle> {
        if self.is_collision_in(stream_id, view)? {
            Ok(StreamHandle::for_id(stream_id))
        } else {
            Ok(StreamHandle::for_hash(self.hasher.hash(stream_id)))
        }
    }

    fn hash_user_in(&self, hash: u64, view: ReadView) -> Result<Option<String>> {
        self.backend
            .get(StateTable::HashUsers, &hash.to_be_bytes(), view)?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|_| ScavengeError::state("bad hash user"))
            })
            .transpose()
    }

    fn weight_in(&self, logical_chunk_number: u32, view: ReadView) -> Result<f32> {
        match self
            .backend
            .get(StateTable::ChunkWeights, &chunk_key(logical_chunk_number), view)?
        {
            Some(bytes) => decode_weight(&bytes),
            None => Ok(0.0),
        }
    }

    /// Persisted checkpoint
    pub fn checkpoint(&self) -> Result<Option<ScavengeCheckpoint>> {
        self.get_value(StateTable::Checkpoint, CHECKPOINT_KEY, ReadView::Committed)
    }

    /// Whether the stream is known to share its hash
    pub fn is_collision(&self, stream_id: &str) -> Result<bool> {
        self.is_collision_in(stream_id, ReadView::Committed)
    }

    /// Handle under which the stream's rows are stored
    pub fn handle_for(&self, stream_id: &str) -> Result<StreamHandle> {
        self.handle_in(stream_id, ReadView::Committed)
    }

    /// First stream registered for a hash
    pub fn hash_user(&self, hash: u64) -> Result<Option<String>> {
        self.hash_user_in(hash, ReadView::Committed)
    }

    /// Every stream known to collide, ascending
    pub fn collisions(&self) -> Result<Vec<String>> {
        let mut streams = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self
                .backend
                .scan(StateTable::Collisions, after.as_deref(), 1_000)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = Some(last.clone());
            for (key, _) in page {
                streams.push(
                    String::from_utf8(key).map_err(|_| ScavengeError::state("bad collision"))?,
                );
            }
        }
        Ok(streams)
    }

    /// Original stream row
    pub fn original_stream(&self, handle: &StreamHandle) -> Result<Option<OriginalStreamData>> {
        self.get_value(
            StateTable::OriginalStreams,
            &handle.to_key(),
            ReadView::Committed,
        )
    }

    /// Metastream row
    pub fn metastream(&self, handle: &StreamHandle) -> Result<Option<MetastreamData>> {
        self.get_value(StateTable::Metastreams, &handle.to_key(), ReadView::Committed)
    }

    /// Original stream rows with handles after `after`, in handle order
    pub fn original_streams_after(
        &self,
        after: &StreamHandle,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, OriginalStreamData)>> {
        self.rows_after(StateTable::OriginalStreams, after, limit)
    }

    /// Metastream rows with handles after `after`, in handle order
    pub fn metastreams_after(
        &self,
        after: &StreamHandle,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, MetastreamData)>> {
        self.rows_after(StateTable::Metastreams, after, limit)
    }

    fn rows_after<T: DeserializeOwned>(
        &self,
        table: StateTable,
        after: &StreamHandle,
        limit: usize,
    ) -> Result<Vec<(StreamHandle, T)>> {
        let key = after.to_key();
        self.backend
            .scan(table, Some(&key), limit)?
            .into_iter()
            .map(|(key, value)| Ok((decode_handle(&key)?, decode(&value)?)))
            .collect()
    }

    /// Facts for deciding a chunk record of `stream_id`
    ///
    /// `None` when nothing is known, which means keep.
    pub fn chunk_execution_info(&self, stream_id: &str) -> Result<Option<ChunkExecutionInfo>> {
        let handle = self.handle_for(stream_id)?;
        if is_metastream(stream_id) {
            Ok(self.metastream(&handle)?.map(|m| m.chunk_execution_info()))
        } else {
            Ok(self
                .original_stream(&handle)?
                .map(|o| o.chunk_execution_info()))
        }
    }

    /// Timestamp range of a logical chunk
    pub fn chunk_time_stamp_range(
        &self,
        logical_chunk_number: u32,
    ) -> Result<Option<ChunkTimeStampRange>> {
        self.get_value(
            StateTable::ChunkTimeStampRanges,
            &chunk_key(logical_chunk_number),
            ReadView::Committed,
        )
    }

    /// Accumulated weight of a logical chunk
    pub fn chunk_weight(&self, logical_chunk_number: u32) -> Result<f32> {
        self.weight_in(logical_chunk_number, ReadView::Committed)
    }

    /// Combined weight of a range of logical chunks
    pub fn sum_chunk_weights(&self, logical_chunks: std::ops::RangeInclusive<u32>) -> Result<f32> {
        let mut total = 0.0;
        for chunk in logical_chunks {
            total += self.chunk_weight(chunk)?;
        }
        Ok(total)
    }

    /// Every logical chunk with a non-zero weight
    pub fn weighted_chunks(&self) -> Result<Vec<(u32, f32)>> {
        let mut weighted = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let page = self
                .backend
                .scan(StateTable::ChunkWeights, after.as_deref(), 1_000)?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = Some(last.clone());
            for (key, value) in page {
                let weight = decode_weight(&value)?;
                if weight > 0.0 {
                    weighted.push((decode_chunk_key(&key)?, weight));
                }
            }
        }
        Ok(weighted)
    }

    /// Whether every weighted chunk has been rewritten
    pub fn all_chunks_executed(&self) -> Result<bool> {
        Ok(self.weighted_chunks()?.is_empty())
    }
}

/// Open transaction on the scavenge state
///
/// Reads through the guard see its own writes.
pub struct ScavengeTransaction<'a, B: StateBackend> {
    state: &'a ScavengeState<B>,
    open: bool,
}

impl<B: StateBackend> ScavengeTransaction<'_, B> {
    fn backend(&self) -> &B {
        &self.state.backend
    }

    fn put_value<T: Serialize>(&self, table: StateTable, key: &[u8], value: &T) -> Result<()> {
        self.backend().put(table, key, &encode(value)?)
    }

    /// Register `stream_id` under its hash, promoting both streams to
    /// identifier handles when the hash already belongs to another stream
    ///
    /// Returns the stream it newly collided with, if any.
    pub fn detect_collisions(&mut self, stream_id: &str) -> Result<Option<String>> {
        if self.state.is_collision_in(stream_id, ReadView::Pending)? {
            return Ok(None);
        }

        let hash = self.state.hasher.hash(stream_id);
        let first_user = match self.state.hash_user_in(hash, ReadView::Pending)? {
            None => {
                self.backend()
                    .put(StateTable::HashUsers, &hash.to_be_bytes(), stream_id.as_bytes())?;
                return Ok(None);
            }
            Some(first_user) if first_user == stream_id => return Ok(None),
            Some(first_user) => first_user,
        };

        warn!(
            stream = stream_id,
            collides_with = %first_user,
            hash = format_args!("{hash:016x}"),
            "Detected stream hash collision"
        );

        self.backend()
            .put(StateTable::Collisions, first_user.as_bytes(), &[])?;
        self.backend()
            .put(StateTable::Collisions, stream_id.as_bytes(), &[])?;

        // Rows stored under the shared hash belong to the first user; move them
        let table = if is_metastream(&first_user) {
            StateTable::Metastreams
        } else {
            StateTable::OriginalStreams
        };
        let hash_key = StreamHandle::for_hash(hash).to_key();
        if let Some(row) = self.backend().get(table, &hash_key, ReadView::Pending)? {
            self.backend().delete(table, &hash_key)?;
            self.backend()
                .put(table, &StreamHandle::for_id(first_user.as_str()).to_key(), &row)?;
            debug!(stream = %first_user, table = table.name(), "Promoted row to identifier handle");
        }

        Ok(Some(first_user))
    }

    /// Handle under which the stream's rows are stored
    pub fn handle_for(&self, stream_id: &str) -> Result<StreamHandle> {
        self.state.handle_in(stream_id, ReadView::Pending)
    }

    /// Original stream row
    pub fn original_stream(&self, handle: &StreamHandle) -> Result<Option<OriginalStreamData>> {
        self.state
            .get_value(StateTable::OriginalStreams, &handle.to_key(), ReadView::Pending)
    }

    /// Insert or replace an original stream row
    pub fn set_original_stream(
        &mut self,
        handle: &StreamHandle,
        data: &OriginalStreamData,
    ) -> Result<()> {
        self.put_value(StateTable::OriginalStreams, &handle.to_key(), data)
    }

    /// Remove an original stream row
    pub fn delete_original_stream(&mut self, handle: &StreamHandle) -> Result<bool> {
        self.backend()
            .delete(StateTable::OriginalStreams, &handle.to_key())
    }

    /// Metastream row
    pub fn metastream(&self, handle: &StreamHandle) -> Result<Option<MetastreamData>> {
        self.state
            .get_value(StateTable::Metastreams, &handle.to_key(), ReadView::Pending)
    }

    /// Insert or replace a metastream row
    pub fn set_metastream(&mut self, handle: &StreamHandle, data: &MetastreamData) -> Result<()> {
        self.put_value(StateTable::Metastreams, &handle.to_key(), data)
    }

    /// Remove a metastream row
    pub fn delete_metastream(&mut self, handle: &StreamHandle) -> Result<bool> {
        self.backend().delete(StateTable::Metastreams, &handle.to_key())
    }

    /// Timestamp range of a logical chunk
    pub fn chunk_time_stamp_range(
        &self,
        logical_chunk_number: u32,
    ) -> Result<Option<ChunkTimeStampRange>> {
        self.state.get_value(
            StateTable::ChunkTimeStampRanges,
            &chunk_key(logical_chunk_number),
            ReadView::Pending,
        )
    }

    /// Widen a logical chunk's timestamp range
    pub fn extend_chunk_time_stamp_range(
        &mut self,
        logical_chunk_number: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        let range = match self.chunk_time_stamp_range(logical_chunk_number)? {
            Some(mut range) => {
                if timestamp >= range.min && timestamp <= range.max {
                    return Ok(());
                }
                range.extend(timestamp);
                range
            }
            None => ChunkTimeStampRange::new(timestamp),
        };
        self.put_value(
            StateTable::ChunkTimeStampRanges,
            &chunk_key(logical_chunk_number),
            &range,
        )
    }

    /// Accumulated weight of a logical chunk
    pub fn chunk_weight(&self, logical_chunk_number: u32) -> Result<f32> {
        self.state.weight_in(logical_chunk_number, ReadView::Pending)
    }

    /// Add to a logical chunk's weight
    pub fn add_chunk_weight(&mut self, logical_chunk_number: u32, delta: f32) -> Result<()> {
        let weight = self.chunk_weight(logical_chunk_number)? + delta;
        self.backend().put(
            StateTable::ChunkWeights,
            &chunk_key(logical_chunk_number),
            &weight.to_le_bytes(),
        )
    }

    /// Forget a logical chunk's weight after it has been rewritten
    pub fn reset_chunk_weight(&mut self, logical_chunk_number: u32) -> Result<()> {
        self.backend()
            .delete(StateTable::ChunkWeights, &chunk_key(logical_chunk_number))?;
        Ok(())
    }

    /// Persist `checkpoint` and every write of the transaction atomically
    pub fn commit(mut self, checkpoint: &ScavengeCheckpoint) -> Result<()> {
        self.put_value(StateTable::Checkpoint, CHECKPOINT_KEY, checkpoint)?;
        self.open = false;
        self.backend().commit()
    }

    /// Discard every write of the transaction
    pub fn rollback(mut self) -> Result<()> {
        self.open = false;
        self.backend().rollback()
    }
}

impl<B: StateBackend> Drop for ScavengeTransaction<'_, B> {
    fn drop(&mut self) {
        if self.open
            && let Err(e) = self.state.backend.rollback()
        {
            warn!(error = %e, "Failed to roll back abandoned transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidelog_core::{Blake3StreamHasher, DiscardPoint, ScavengePoint};

    /// Hasher that maps every stream to its length
    struct LengthHasher;

    impl StreamHasher for LengthHasher {
        fn hash(&self, stream_id: &str) -> u64 {
            stream_id.len() as u64
        }
    }

    fn state_with(hasher: Arc<dyn StreamHasher>) -> ScavengeState<InMemoryStateBackend> {
        ScavengeState::new(InMemoryStateBackend::new(), hasher)
    }

    fn checkpoint() -> ScavengeCheckpoint {
        ScavengeCheckpoint::Cleaning {
            scavenge_point: ScavengePoint {
                position: 0,
                event_number: 0,
                effective_now: chrono::DateTime::UNIX_EPOCH,
                threshold: 0.0,
            },
        }
    }

    #[test]
    fn test_collision_promotes_rows() {
        let state = state_with(Arc::new(LengthHasher));
        let mut txn = state.begin().unwrap();

        assert_eq!(txn.detect_collisions("ab").unwrap(), None);
        let hash_handle = txn.handle_for("ab").unwrap();
        assert_eq!(hash_handle, StreamHandle::Hash(2));

        let row = OriginalStreamData {
            max_count: Some(3),
            ..Default::default()
        };
        txn.set_original_stream(&hash_handle, &row).unwrap();

        // Same length, different stream
        assert_eq!(txn.detect_collisions("cd").unwrap(), Some("ab".to_string()));
        assert_eq!(txn.handle_for("ab").unwrap(), StreamHandle::for_id("ab"));
        assert_eq!(txn.handle_for("cd").unwrap(), StreamHandle::for_id("cd"));
        assert!(txn.original_stream(&hash_handle).unwrap().is_none());
        assert_eq!(
            txn.original_stream(&StreamHandle::for_id("ab")).unwrap(),
            Some(row)
        );
        txn.commit(&checkpoint()).unwrap();

        assert_eq!(state.collisions().unwrap(), vec!["ab", "cd"]);
    }

    #[test]
    fn test_collision_detection_is_idempotent() {
        let state = state_with(Arc::new(LengthHasher));
        let mut txn = state.begin().unwrap();
        txn.detect_collisions("ab").unwrap();
        txn.detect_collisions("cd").unwrap();
        assert_eq!(txn.detect_collisions("cd").unwrap(), None);
        assert_eq!(txn.detect_collisions("ab").unwrap(), None);
        // A third stream joins the collision without promoting anything
        assert_eq!(txn.detect_collisions("ef").unwrap(), Some("ab".to_string()));
        txn.commit(&checkpoint()).unwrap();
        assert_eq!(state.collisions().unwrap().len(), 3);
    }

    #[test]
    fn test_metastream_collision_promotes_metastream_row() {
        let state = state_with(Arc::new(LengthHasher));
        let mut txn = state.begin().unwrap();
        txn.detect_collisions("$$a").unwrap();
        let handle = txn.handle_for("$$a").unwrap();
        let row = MetastreamData {
            discard_point: DiscardPoint::discard_before(1),
            ..Default::default()
        };
        txn.set_metastream(&handle, &row).unwrap();

        txn.detect_collisions("xyz").unwrap();
        assert_eq!(
            txn.metastream(&StreamHandle::for_id("$$a")).unwrap(),
            Some(row)
        );
        txn.commit(&checkpoint()).unwrap();
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let state = state_with(Arc::new(Blake3StreamHasher));
        {
            let mut txn = state.begin().unwrap();
            txn.add_chunk_weight(3, 2.0).unwrap();
        }
        assert_eq!(state.chunk_weight(3).unwrap(), 0.0);
        assert!(state.checkpoint().unwrap().is_none());
        assert!(!state.backend().in_transaction());
    }

    #[test]
    fn test_second_transaction_is_rejected() {
        let state = state_with(Arc::new(Blake3StreamHasher));
        let _txn = state.begin().unwrap();
        assert!(matches!(
            state.begin(),
            Err(ScavengeError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_weights_and_ranges() {
        let state = state_with(Arc::new(Blake3StreamHasher));
        let mut txn = state.begin().unwrap();
        txn.add_chunk_weight(1, 2.0).unwrap();
        txn.add_chunk_weight(1, 1.0).unwrap();
        txn.add_chunk_weight(2, 2.0).unwrap();
        let t0 = chrono::DateTime::UNIX_EPOCH;
        txn.extend_chunk_time_stamp_range(1, t0 + chrono::TimeDelta::seconds(10))
            .unwrap();
        txn.extend_chunk_time_stamp_range(1, t0).unwrap();
        txn.commit(&checkpoint()).unwrap();

        assert_eq!(state.chunk_weight(1).unwrap(), 3.0);
        assert_eq!(state.sum_chunk_weights(0..=2).unwrap(), 5.0);
        assert!(!state.all_chunks_executed().unwrap());
        let range = state.chunk_time_stamp_range(1).unwrap().unwrap();
        assert_eq!(range.min, t0);

        let mut txn = state.begin().unwrap();
        txn.reset_chunk_weight(1).unwrap();
        txn.reset_chunk_weight(2).unwrap();
        txn.commit(&checkpoint()).unwrap();
        assert!(state.all_chunks_executed().unwrap());
        assert_eq!(state.checkpoint().unwrap(), Some(checkpoint()));
    }
}
