//! Explicit transactions.
//!
//! A transaction borrows the store mutably, so at most one exists at a time
//! and nothing else can write while it is open. Writes land in the pager's
//! pending table and become durable on `commit`. Dropping a transaction
//! without committing rolls it back.

use crate::storage::btree::Comparator;
use crate::storage::iter::{StoreCursor, StoreScan};
use crate::storage::store::{SetMode, Store, StoreError};

/// A group of writes committed together.
pub struct Transaction<'a> {
    store: &'a mut Store,
    done: bool,
    /// Set by a non-constraint error; the pending state is then unreliable.
    failed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a mut Store) -> Self {
        tracing::trace!(root = store.pager.root(), "transaction started");
        Self {
            store,
            done: false,
            failed: false,
        }
    }

    fn guard(&self) -> Result<(), StoreError> {
        self.store.pager.check_usable()?;
        if self.failed {
            return Err(StoreError::Aborted);
        }
        Ok(())
    }

    fn track<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        let result = self.store.pager.observe(result);
        if let Err(e) = &result {
            if !matches!(e, StoreError::Constraint(_)) {
                self.failed = true;
            }
        }
        result
    }

    /// Look up `key`, including writes made by this transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, StoreError> {
        self.guard()?;
        self.store.get(key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8], mode: SetMode) -> Result<(), StoreError> {
        self.guard()?;
        let result = self.store.write_set(key, value, mode);
        self.track(result)
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set(key, value, SetMode::Insert)
    }

    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set(key, value, SetMode::Update)
    }

    pub fn upsert(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.set(key, value, SetMode::Upsert)
    }

    /// Remove `key`. Returns whether it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.guard()?;
        let result = self.store.write_delete(key);
        self.track(result)
    }

    pub fn seek(&self, key: &[u8], cmp: Comparator) -> Result<StoreCursor<'_>, StoreError> {
        self.guard()?;
        self.store.seek(key, cmp)
    }

    pub fn scan(
        &self,
        start: (&[u8], Comparator),
        end: Option<(&[u8], Comparator)>,
    ) -> Result<StoreScan<'_>, StoreError> {
        self.guard()?;
        self.store.scan(start, end)
    }

    /// Make every write of this transaction durable.
    ///
    /// A transaction that hit a non-constraint error is rolled back and
    /// returns `Aborted`.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.done = true;
        if let Err(e) = self.guard() {
            self.store.pager.rollback();
            return Err(e);
        }
        let result = self.store.pager.commit();
        if result.is_err() {
            // the data phase rolls back on its own; this covers the rest
            self.store.pager.rollback();
        }
        result
    }

    /// Discard every write of this transaction.
    pub fn abort(mut self) {
        self.done = true;
        self.store.pager.rollback();
        tracing::debug!("transaction aborted");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("transaction dropped without commit, rolling back");
            self.store.pager.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fault::FaultConfig;
    use crate::storage::page::PAGE_SIZE_U64;
    use crate::storage::store::{ConstraintError, StoreOptions};
    use tempfile::tempdir;

    fn options() -> StoreOptions {
        StoreOptions::default().with_initial_mmap_bytes(16 * PAGE_SIZE_U64)
    }

    #[test]
    fn test_transaction_commit() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.cowkv");
        let mut store = Store::open_with(&path, &options()).expect("open");

        {
            let mut txn = store.begin().expect("begin");
            txn.insert(b"alpha", b"1").expect("insert");
            txn.insert(b"beta", b"2").expect("insert");
            assert_eq!(txn.get(b"alpha").expect("get"), Some(&b"1"[..]));
            txn.commit().expect("commit");
        }
        assert_eq!(store.get(b"beta").expect("get"), Some(&b"2"[..]));
        assert_eq!(store.stats().expect("stats").commits, 1);
        store.close().expect("close");

        let store = Store::open_with(&path, &options()).expect("reopen");
        assert_eq!(store.get(b"alpha").expect("get"), Some(&b"1"[..]));
    }

    #[test]
    fn test_transaction_abort() {
        let dir = tempdir().expect("create temp dir");
        let mut store = Store::open_with(&dir.path().join("t.cowkv"), &options()).expect("open");
        store.upsert(b"keep", b"1").expect("upsert");

        let mut txn = store.begin().expect("begin");
        txn.upsert(b"drop", b"2").expect("upsert");
        assert!(txn.delete(b"keep").expect("delete"));
        txn.abort();

        assert_eq!(store.get(b"keep").expect("get"), Some(&b"1"[..]));
        assert_eq!(store.get(b"drop").expect("get"), None);
        assert_eq!(store.stats().expect("stats").pending_pages, 0);
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = tempdir().expect("create temp dir");
        let mut store = Store::open_with(&dir.path().join("t.cowkv"), &options()).expect("open");
        {
            let mut txn = store.begin().expect("begin");
            txn.upsert(b"k", b"v").expect("upsert");
        }
        assert_eq!(store.get(b"k").expect("get"), None);
        assert_eq!(store.stats().expect("stats").rollbacks, 1);
    }

    #[test]
    fn test_constraint_error_keeps_transaction_usable() {
        let dir = tempdir().expect("create temp dir");
        let mut store = Store::open_with(&dir.path().join("t.cowkv"), &options()).expect("open");
        let mut txn = store.begin().expect("begin");
        txn.insert(b"k", b"v").expect("insert");
        assert!(matches!(
            txn.insert(b"k", b"w"),
            Err(StoreError::Constraint(ConstraintError::KeyExists))
        ));
        txn.upsert(b"j", b"w").expect("upsert");
        txn.commit().expect("commit");
        assert_eq!(store.stats().expect("stats").keys, 2);
    }

    #[test]
    fn test_data_phase_failure_rolls_back() {
        let dir = tempdir().expect("create temp dir");
        let opts = options().with_faults(FaultConfig::fail_data_phase());
        let mut store = Store::open_with(&dir.path().join("t.cowkv"), &opts).expect("open");
        let mut txn = store.begin().expect("begin");
        txn.upsert(b"k", b"v").expect("upsert");
        assert!(matches!(txn.commit(), Err(StoreError::Io(_))));
        assert_eq!(store.get(b"k").expect("get"), None);
        // the store stays usable
        assert!(store.begin().is_ok());
    }
}
