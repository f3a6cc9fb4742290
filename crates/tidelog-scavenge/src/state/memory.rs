//! In-memory state backend
//!
//! Committed tables are plain `BTreeMap`s; an open transaction is an overlay
//! of pending puts and deletes that is merged on commit and dropped on
//! rollback.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use super::backend::{ReadView, ScanResults, StateBackend, StateTable};
use crate::error::{Result, ScavengeError};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
/// `None` marks a pending delete
type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Debug, Default)]
struct Inner {
    committed: [Table; StateTable::COUNT],
    pending: Option<[Overlay; StateTable::COUNT]>,
}

/// State backend that lives and dies with the process
#[derive(Debug, Default)]
pub struct InMemoryStateBackend {
    inner: RwLock<Inner>,
}

impl InMemoryStateBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed rows in a table
    pub fn len(&self, table: StateTable) -> usize {
        self.inner.read().committed[table.index()].len()
    }
}

impl StateBackend for InMemoryStateBackend {
    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.pending.is_some() {
            return Err(ScavengeError::invariant("transaction already open"));
        }
        inner.pending = Some(Default::default());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let pending = inner
            .pending
            .take()
            .ok_or_else(|| ScavengeError::invariant("commit without a transaction"))?;

        for (table, overlay) in inner.committed.iter_mut().zip(pending) {
            for (key, value) in overlay {
                match value {
                    Some(value) => {
                        table.insert(key, value);
                    }
                    None => {
                        table.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.inner
            .write()
            .pending
            .take()
            .map(|_| ())
            .ok_or_else(|| ScavengeError::invariant("rollback without a transaction"))
    }

    fn in_transaction(&self) -> bool {
        self.inner.read().pending.is_some()
    }

    fn get(&self, table: StateTable, key: &[u8], view: ReadView) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read();
        if view == ReadView::Pending
            && let Some(pending) = &inner.pending
            && let Some(value) = pending[table.index()].get(key)
        {
            return Ok(value.clone());
        }
        Ok(inner.committed[table.index()].get(key).cloned())
    }

    fn put(&self, table: StateTable, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        let pending = inner
            .pending
            .as_mut()
            .ok_or_else(|| ScavengeError::invariant("write outside a transaction"))?;
        pending[table.index()].insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, table: StateTable, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.write();
        let Inner { committed, pending } = &mut *inner;
        let pending = pending
            .as_mut()
            .ok_or_else(|| ScavengeError::invariant("delete outside a transaction"))?;

        let existed = match pending[table.index()].get(key) {
            Some(value) => value.is_some(),
            None => committed[table.index()].contains_key(key),
        };
        pending[table.index()].insert(key.to_vec(), None);
        Ok(existed)
    }

    fn scan(&self, table: StateTable, after: Option<&[u8]>, limit: usize) -> Result<ScanResults> {
        let inner = self.inner.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        Ok(inner.committed[table.index()]
            .range::<[u8], _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
