//! Durable state backend on redb
//!
//! Each [`StateTable`] maps to one redb table. A redb write transaction is
//! held open between `begin` and `commit`, so a crash at any point leaves the
//! database exactly as of the last commit.

use std::ops::Bound;
use std::path::PathBuf;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, info, instrument, warn};

use super::backend::{ReadView, ScanResults, StateBackend, StateTable};
use crate::error::{Result, ScavengeError};

// Key: big-endian stream hash, Value: stream id
const HASH_USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("hash_users");

// Key: stream id, Value: empty
const COLLISIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("collisions");

// Key: encoded stream handle, Value: serialized OriginalStreamData
const ORIGINAL_STREAMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("original_streams");

// Key: encoded stream handle, Value: serialized MetastreamData
const METASTREAMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("metastreams");

// Key: big-endian logical chunk number, Value: serialized ChunkTimeStampRange
const CHUNK_TIMESTAMP_RANGES: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("chunk_timestamp_ranges");

// Key: big-endian logical chunk number, Value: serialized weight
const CHUNK_WEIGHTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chunk_weights");

// Key: fixed, Value: serialized ScavengeCheckpoint
const CHECKPOINT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("checkpoint");

fn definition(table: StateTable) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match table {
        StateTable::HashUsers => HASH_USERS,
        StateTable::Collisions => COLLISIONS,
        StateTable::OriginalStreams => ORIGINAL_STREAMS,
        StateTable::Metastreams => METASTREAMS,
        StateTable::ChunkTimeStampRanges => CHUNK_TIMESTAMP_RANGES,
        StateTable::ChunkWeights => CHUNK_WEIGHTS,
        StateTable::Checkpoint => CHECKPOINT,
    }
}

fn db_error(err: impl std::fmt::Display) -> ScavengeError {
    ScavengeError::State(err.to_string())
}

/// Configuration for the redb state backend
#[derive(Debug, Clone)]
pub struct RedbStateConfig {
    /// Path to the database file
    pub db_path: PathBuf,
    /// Cache size in bytes
    pub cache_size: usize,
}

impl Default for RedbStateConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/scavenge.redb"),
            cache_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// State backend persisted in a redb database file
pub struct RedbStateBackend {
    db: Database,
    config: RedbStateConfig,
    write: Mutex<Option<WriteTransaction>>,
}

impl RedbStateBackend {
    /// Open or create the database
    #[instrument(skip(config), fields(path = %config.db_path.display()))]
    pub fn open(config: RedbStateConfig) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::builder()
            .set_cache_size(config.cache_size)
            .create(&config.db_path)
            .map_err(db_error)?;

        info!("Opened scavenge state database");

        let backend = Self {
            db,
            config,
            write: Mutex::new(None),
        };
        backend.init_tables()?;
        Ok(backend)
    }

    /// Create every table if it doesn't exist
    fn init_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(db_error)?;
        for table in StateTable::ALL {
            write_txn.open_table(definition(table)).map_err(db_error)?;
        }
        write_txn.commit().map_err(db_error)?;

        debug!("Initialized scavenge state tables");
        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &RedbStateConfig {
        &self.config
    }

    fn get_committed(&self, table: StateTable, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(db_error)?;
        let table = read_txn.open_table(definition(table)).map_err(db_error)?;
        let value = table.get(key).map_err(db_error)?.map(|v| v.value().to_vec());
        Ok(value)
    }
}

impl StateBackend for RedbStateBackend {
    fn begin(&self) -> Result<()> {
        let mut write = self.write.lock();
        if write.is_some() {
            return Err(ScavengeError::invariant("transaction already open"));
        }
        *write = Some(self.db.begin_write().map_err(db_error)?);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let txn = self
            .write
            .lock()
            .take()
            .ok_or_else(|| ScavengeError::invariant("commit without a transaction"))?;
        txn.commit().map_err(db_error)
    }

    fn rollback(&self) -> Result<()> {
        let txn = self
            .write
            .lock()
            .take()
            .ok_or_else(|| ScavengeError::invariant("rollback without a transaction"))?;
        txn.abort().map_err(db_error)
    }

    fn in_transaction(&self) -> bool {
        self.write.lock().is_some()
    }

    fn get(&self, table: StateTable, key: &[u8], view: ReadView) -> Result<Option<Vec<u8>>> {
        if view == ReadView::Pending {
            let write = self.write.lock();
            if let Some(txn) = write.as_ref() {
                let table = txn.open_table(definition(table)).map_err(db_error)?;
                let value = table.get(key).map_err(db_error)?.map(|v| v.value().to_vec());
                return Ok(value);
            }
        }
        self.get_committed(table, key)
    }

    fn put(&self, table: StateTable, key: &[u8], value: &[u8]) -> Result<()> {
        let write = self.write.lock();
        let txn = write
            .as_ref()
            .ok_or_else(|| ScavengeError::invariant("write outside a transaction"))?;
        let mut table = txn.open_table(definition(table)).map_err(db_error)?;
        table.insert(key, value).map_err(db_error)?;
        Ok(())
    }

    fn delete(&self, table: StateTable, key: &[u8]) -> Result<bool> {
        let write = self.write.lock();
        let txn = write
            .as_ref()
            .ok_or_else(|| ScavengeError::invariant("delete outside a transaction"))?;
        let mut table = txn.open_table(definition(table)).map_err(db_error)?;
        let removed = table.remove(key).map_err(db_error)?.is_some();
        Ok(removed)
    }

    fn scan(&self, table: StateTable, after: Option<&[u8]>, limit: usize) -> Result<ScanResults> {
        let read_txn = self.db.begin_read().map_err(db_error)?;
        let table = read_txn.open_table(definition(table)).map_err(db_error)?;

        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let range = table
            .range::<&[u8]>((lower, Bound::Unbounded))
            .map_err(db_error)?;

        let mut results = Vec::new();
        for entry in range.take(limit) {
            let (key, value) = entry.map_err(db_error)?;
            results.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(results)
    }
}

impl Drop for RedbStateBackend {
    fn drop(&mut self) {
        if let Some(txn) = self.write.get_mut().take()
            && let Err(e) = txn.abort()
        {
            warn!(error = %e, "Failed to abort open state transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_backend(temp_dir: &TempDir) -> RedbStateBackend {
        let config = RedbStateConfig {
            db_path: temp_dir.path().join("state.redb"),
            ..Default::default()
        };
        RedbStateBackend::open(config).unwrap()
    }

    #[test]
    fn test_commit_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend = create_test_backend(&temp_dir);
            backend.begin().unwrap();
            backend.put(StateTable::Checkpoint, b"cp", b"value").unwrap();
            backend.commit().unwrap();

            backend.begin().unwrap();
            backend.put(StateTable::Checkpoint, b"lost", b"value").unwrap();
            // Dropped with the transaction open
        }

        let backend = create_test_backend(&temp_dir);
        let kept = backend
            .get(StateTable::Checkpoint, b"cp", ReadView::Committed)
            .unwrap();
        assert_eq!(kept, Some(b"value".to_vec()));
        assert!(backend
            .get(StateTable::Checkpoint, b"lost", ReadView::Committed)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_pending_and_committed_views() {
        let temp_dir = TempDir::new().unwrap();
        let backend = create_test_backend(&temp_dir);

        backend.begin().unwrap();
        backend.put(StateTable::HashUsers, b"h", b"orders").unwrap();
        assert!(backend.get(StateTable::HashUsers, b"h", ReadView::Pending).unwrap().is_some());
        assert!(backend.get(StateTable::HashUsers, b"h", ReadView::Committed).unwrap().is_none());
        backend.rollback().unwrap();

        assert!(backend.get(StateTable::HashUsers, b"h", ReadView::Pending).unwrap().is_none());
    }

    #[test]
    fn test_write_outside_transaction_fails() {
        let temp_dir = TempDir::new().unwrap();
        let backend = create_test_backend(&temp_dir);
        assert!(matches!(
            backend.put(StateTable::Collisions, b"x", b""),
            Err(ScavengeError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_scan_after() {
        let temp_dir = TempDir::new().unwrap();
        let backend = create_test_backend(&temp_dir);

        backend.begin().unwrap();
        for key in [b"1", b"2", b"3"] {
            backend.put(StateTable::OriginalStreams, key, b"v").unwrap();
        }
        backend.commit().unwrap();

        let rows = backend
            .scan(StateTable::OriginalStreams, Some(b"1".as_slice()), 10)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"2".to_vec());
    }
}
