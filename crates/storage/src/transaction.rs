//! Deferred physical effects of a backend transaction.
//!
//! POSIX renames and object-store deletes cannot be rolled back by the SQL
//! engine, so destructive backend work is staged here and only made
//! permanent once the enclosing SQL transaction's outcome is known. The
//! explicit idle/active state makes a double `begin` unrepresentable as a
//! silent overwrite.

use crate::error::{StorageError, StorageResult};
use std::collections::HashSet;
use std::hash::Hash;

/// Staged effect sets of one open transaction.
#[derive(Debug)]
pub(crate) struct TxSets<K> {
    /// Payloads written since `begin`; removed on rollback.
    pub created: HashSet<K>,
    /// Deletions deferred in full until commit (no reversible staging).
    pub deleted: HashSet<K>,
    /// Soft-deleted payloads (renamed aside); finalized on commit,
    /// restored on rollback.
    pub marked: HashSet<K>,
}

/// Transaction log owned by a backend, keyed by whatever the backend needs
/// to undo or finalize an effect (paths, idents, object keys).
#[derive(Debug)]
pub(crate) struct TxLog<K> {
    active: bool,
    created: HashSet<K>,
    deleted: HashSet<K>,
    marked: HashSet<K>,
}

impl<K: Eq + Hash> TxLog<K> {
    pub fn new() -> Self {
        Self {
            active: false,
            created: HashSet::new(),
            deleted: HashSet::new(),
            marked: HashSet::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn begin(&mut self) -> StorageResult<()> {
        if self.active {
            return Err(StorageError::InvalidParameter(
                "transaction already open".to_string(),
            ));
        }
        self.active = true;
        Ok(())
    }

    /// Record a payload written inside the transaction. No-op while idle.
    pub fn note_created(&mut self, key: K) {
        if self.active {
            self.created.insert(key);
        }
    }

    /// Forget a created payload again (created and deleted in the same
    /// transaction). Returns whether it was present.
    pub fn remove_created(&mut self, key: &K) -> bool {
        self.created.remove(key)
    }

    /// Stage a deletion performed entirely at commit.
    pub fn stage_delete(&mut self, key: K) {
        self.deleted.insert(key);
    }

    /// Stage a soft-deleted (renamed aside) payload.
    pub fn stage_marked(&mut self, key: K) {
        self.marked.insert(key);
    }

    /// Close the transaction and hand out the staged sets.
    pub fn end(&mut self) -> StorageResult<TxSets<K>> {
        if !self.active {
            return Err(StorageError::InvalidParameter(
                "no transaction open".to_string(),
            ));
        }
        self.active = false;
        Ok(TxSets {
            created: std::mem::take(&mut self.created),
            deleted: std::mem::take(&mut self.deleted),
            marked: std::mem::take(&mut self.marked),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_begin_rejected() {
        let mut log: TxLog<u64> = TxLog::new();
        log.begin().unwrap();
        assert!(log.begin().is_err());
    }

    #[test]
    fn test_end_without_begin_rejected() {
        let mut log: TxLog<u64> = TxLog::new();
        assert!(log.end().is_err());
    }

    #[test]
    fn test_created_ignored_while_idle() {
        let mut log: TxLog<u64> = TxLog::new();
        log.note_created(1);
        log.begin().unwrap();
        log.note_created(2);
        let sets = log.end().unwrap();
        assert!(!sets.created.contains(&1));
        assert!(sets.created.contains(&2));
    }

    #[test]
    fn test_sets_reset_between_transactions() {
        let mut log: TxLog<u64> = TxLog::new();
        log.begin().unwrap();
        log.note_created(1);
        log.stage_marked(2);
        log.end().unwrap();

        log.begin().unwrap();
        let sets = log.end().unwrap();
        assert!(sets.created.is_empty());
        assert!(sets.marked.is_empty());
        assert!(sets.deleted.is_empty());
    }
}
