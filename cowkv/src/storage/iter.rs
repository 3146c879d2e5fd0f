//! Cursors and scans handed out by the store.
//!
//! They wrap the tree cursor and scan so that a page failing to decode
//! during iteration poisons the store, the same as it does for a point read.

use crate::storage::btree::{Cursor, Scan};
use crate::storage::pager::Pager;
use crate::storage::store::StoreError;

/// A position in the store's key order.
pub struct StoreCursor<'a> {
    inner: Cursor<'a, Pager>,
    pager: &'a Pager,
}

impl<'a> StoreCursor<'a> {
    pub(crate) const fn new(inner: Cursor<'a, Pager>, pager: &'a Pager) -> Self {
        Self { inner, pager }
    }

    /// The key and value under the cursor, or `None` past either end.
    pub fn entry(&self) -> Result<Option<(&'a [u8], &'a [u8])>, StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.inner.entry())
    }

    pub fn valid(&self) -> Result<bool, StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.inner.valid())
    }

    pub fn move_next(&mut self) -> Result<(), StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.inner.move_next())
    }

    pub fn move_prev(&mut self) -> Result<(), StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.inner.move_prev())
    }
}

/// A bounded walk over the store, yielding borrowed key-value pairs.
pub struct StoreScan<'a> {
    inner: Scan<'a, Pager>,
    pager: &'a Pager,
    failed: bool,
}

impl<'a> StoreScan<'a> {
    pub(crate) const fn new(inner: Scan<'a, Pager>, pager: &'a Pager) -> Self {
        Self {
            inner,
            pager,
            failed: false,
        }
    }
}

impl<'a> Iterator for StoreScan<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.pager.check_usable() {
            self.failed = true;
            return Some(Err(e));
        }
        let item = self.inner.next()?;
        let item = self.pager.observe(item);
        self.failed = item.is_err();
        Some(item)
    }
}
