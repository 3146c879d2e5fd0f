//! Key-value store interface.
//!
//! Provides opening and closing a store file, point reads and writes that
//! commit immediately, ordered seeks and range scans, and explicit
//! transactions.

use std::collections::HashSet;
use std::path::Path;

use crate::storage::btree::{BTree, BTreeError, Comparator, Scan};
use crate::storage::fault::{FaultConfig, FaultStats};
use crate::storage::freelist::FreeListError;
use crate::storage::io::StorageError;
use crate::storage::iter::{StoreCursor, StoreScan};
use crate::storage::master::MasterError;
use crate::storage::page::{MAX_KEY_SIZE, MAX_VALUE_SIZE, PageId};
use crate::storage::pager::Pager;
use crate::storage::transaction::Transaction;

/// Size of the first memory mapping.
pub const DEFAULT_INITIAL_MMAP_BYTES: u64 = 64 << 20;

/// Options for opening a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreOptions {
    /// Bytes mapped at open, doubled until it covers the file. Must be a
    /// non-zero multiple of the page size.
    ///
    /// `AppConfig` never sets less than `DEFAULT_INITIAL_MMAP_BYTES`. Smaller
    /// values are accepted here so tests can reach mapping growth with a
    /// few pages.
    pub initial_mmap_bytes: u64,
    /// Copy every committed page into memory at open.
    pub rehydrate_on_open: bool,
    pub faults: FaultConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            initial_mmap_bytes: DEFAULT_INITIAL_MMAP_BYTES,
            rehydrate_on_open: false,
            faults: FaultConfig::default(),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub const fn with_initial_mmap_bytes(mut self, bytes: u64) -> Self {
        self.initial_mmap_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_rehydrate_on_open(mut self, rehydrate: bool) -> Self {
        self.rehydrate_on_open = rehydrate;
        self
    }

    #[must_use]
    pub const fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }
}

/// How `set` treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    /// Fail if the key exists.
    Insert,
    /// Fail if the key is missing.
    Update,
    /// Insert or replace.
    #[default]
    Upsert,
}

/// A snapshot of store state and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub root: PageId,
    pub height: usize,
    pub keys: u64,
    /// Pages holding committed data, including the master page.
    pub flushed: u64,
    pub file_pages: u64,
    pub free_pages: u64,
    pub free_list_nodes: usize,
    pub pending_pages: usize,
    pub pages_reused: u64,
    pub pages_appended: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub mapped_bytes: u64,
    pub mmap_chunks: usize,
    pub resident_pages: usize,
    pub faults: FaultStats,
}

/// A single-file, single-writer key-value store.
pub struct Store {
    pub(crate) pager: Pager,
}

impl Store {
    /// Open the store at `path`, creating it if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, &StoreOptions::default())
    }

    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        Ok(Self {
            pager: Pager::open(path, options)?,
        })
    }

    /// Flush and close the store.
    pub fn close(self) -> Result<(), StoreError> {
        self.pager.close()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.pager.path()
    }

    /// Look up `key`. Sees writes of the open transaction.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, StoreError> {
        self.pager.check_usable()?;
        let tree = BTree::new(&self.pager, self.pager.root());
        self.pager.observe(tree.lookup(key))
    }

    /// Write `key` and commit.
    pub fn set(&mut self, key: &[u8], value: &[u8], mode: SetMode) -> Result<(), StoreError> {
        self.pager.check_usable()?;
        let result = self
            .write_set(key, value, mode)
            .and_then(|()| self.pager.commit());
        self.finish(result)
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

    /// Remove `key` and commit. Returns whether the key existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        self.pager.check_usable()?;
        let result = self.write_delete(key).and_then(|deleted| {
            self.pager.commit()?;
            Ok(deleted)
        });
        self.finish(result)
    }

    /// Position a cursor at the key nearest to `key` that satisfies `cmp`.
    pub fn seek(&self, key: &[u8], cmp: Comparator) -> Result<StoreCursor<'_>, StoreError> {
        self.pager.check_usable()?;
        let tree = BTree::new(&self.pager, self.pager.root());
        let cursor = self.pager.observe(tree.seek(key, cmp))?;
        Ok(StoreCursor::new(cursor, &self.pager))
    }

    /// Iterate from `start` towards `end`.
    ///
    /// The start comparator sets the direction. A bounded scan needs an end
    /// comparator pointing the other way, e.g. `(a, >=)` to `(b, <)`.
    pub fn scan(
        &self,
        start: (&[u8], Comparator),
        end: Option<(&[u8], Comparator)>,
    ) -> Result<StoreScan<'_>, StoreError> {
        if let Some((_, end_cmp)) = end {
            if end_cmp.is_forward() == start.1.is_forward() {
                return Err(ConstraintError::InvalidRange.into());
            }
        }
        self.pager.check_usable()?;
        let tree = BTree::new(&self.pager, self.pager.root());
        let cursor = self.pager.observe(tree.seek(start.0, start.1))?;
        Ok(StoreScan::new(Scan::new(cursor, start.1, end), &self.pager))
    }

    /// Start a transaction. Changes become durable on `Transaction::commit`.
    pub fn begin(&mut self) -> Result<Transaction<'_>, StoreError> {
        self.pager.check_usable()?;
        Ok(Transaction::new(self))
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.collect_stats())
    }

    /// Verify that every committed page is used exactly once: by the tree,
    /// as a free-list node, or as a free-list entry.
    pub fn check(&self) -> Result<(), StoreError> {
        self.pager.check_usable()?;
        self.pager.observe(self.check_accounting())
    }

    fn collect_stats(&self) -> Result<StoreStats, StoreError> {
        let tree = BTree::new(&self.pager, self.pager.root());
        let counters = self.pager.counters();
        Ok(StoreStats {
            root: tree.root(),
            height: tree.height()?,
            keys: tree.count()?,
            flushed: self.pager.flushed(),
            file_pages: self.pager.file_pages(),
            free_pages: self.pager.free_total(),
            free_list_nodes: self.pager.free_list().nodes(&self.pager)?.len(),
            pending_pages: self.pager.pending_pages(),
            pages_reused: counters.pages_reused,
            pages_appended: counters.pages_appended,
            commits: counters.commits,
            rollbacks: counters.rollbacks,
            mapped_bytes: self.pager.mapped_bytes(),
            mmap_chunks: self.pager.mmap_chunks(),
            resident_pages: self.pager.resident_pages(),
            faults: self.pager.fault_stats(),
        })
    }

    fn check_accounting(&self) -> Result<(), StoreError> {
        let flushed = self.pager.flushed();
        let free = self.pager.free_list();
        free.check(&self.pager)?;

        let mut seen: HashSet<PageId> = HashSet::new();
        let mut claim = |id: PageId, owner: &str| -> Result<(), StoreError> {
            if id == 0 || id >= flushed {
                return Err(StoreError::Corruption(format!(
                    "{owner} page {id} outside 1..{flushed}"
                )));
            }
            if !seen.insert(id) {
                return Err(StoreError::Corruption(format!(
                    "page {id} claimed twice (last by {owner})"
                )));
            }
            Ok(())
        };

        for id in BTree::new(&self.pager, self.pager.root()).pages()? {
            claim(id, "tree")?;
        }
        for node in free.nodes(&self.pager)? {
            claim(node.page_id, "free-list node")?;
            for id in node.pointers {
                claim(id, "free")?;
            }
        }

        let used = seen.len() as u64 + 1;
        if used != flushed {
            return Err(StoreError::Corruption(format!(
                "{used} pages accounted for, {flushed} flushed"
            )));
        }
        Ok(())
    }

    /// Apply a write to the working tree without committing.
    pub(crate) fn write_set(
        &mut self,
        key: &[u8],
        value: &[u8],
        mode: SetMode,
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(ConstraintError::ValueTooLarge(value.len()).into());
        }
        match (mode, self.get(key)?.is_some()) {
            (SetMode::Insert, true) => return Err(ConstraintError::KeyExists.into()),
            (SetMode::Update, false) => return Err(ConstraintError::KeyNotFound.into()),
            _ => {}
        }

        let root = self.pager.root();
        let mut tree = BTree::new(&mut self.pager, root);
        tree.insert(key, value)?;
        let root = tree.root();
        self.pager.set_root(root);
        Ok(())
    }

    /// Remove a key from the working tree without committing.
    pub(crate) fn write_delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        validate_key(key)?;
        let root = self.pager.root();
        let mut tree = BTree::new(&mut self.pager, root);
        let deleted = tree.delete(key)?;
        let root = tree.root();
        self.pager.set_root(root);
        Ok(deleted)
    }

    /// Roll back after a failed auto-commit operation.
    fn finish<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        let result = self.pager.observe(result);
        if result.is_err() {
            self.pager.rollback();
        }
        result
    }
}

fn validate_key(key: &[u8]) -> Result<(), ConstraintError> {
    if key.is_empty() {
        return Err(ConstraintError::EmptyKey);
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(ConstraintError::KeyTooLarge(key.len()));
    }
    Ok(())
}

/// A write rejected before it changed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// Insert of a key that is already present.
    KeyExists,
    /// Update of a key that is not present.
    KeyNotFound,
    EmptyKey,
    KeyTooLarge(usize),
    ValueTooLarge(usize),
    /// Start and end comparators point the same way.
    InvalidRange,
}

impl std::fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyExists => write!(f, "key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::EmptyKey => write!(f, "key is empty"),
            Self::KeyTooLarge(len) => {
                write!(f, "key of {len} bytes exceeds the {MAX_KEY_SIZE} byte limit")
            }
            Self::ValueTooLarge(len) => {
                write!(f, "value of {len} bytes exceeds the {MAX_VALUE_SIZE} byte limit")
            }
            Self::InvalidRange => write!(f, "scan bounds must point in opposite directions"),
        }
    }
}

impl std::error::Error for ConstraintError {}

/// Errors returned by the store.
#[derive(Debug)]
pub enum StoreError {
    /// The master page is invalid; the store refuses to open.
    Structural(MasterError),
    /// A file operation failed. The open transaction was rolled back.
    Io(std::io::Error),
    Constraint(ConstraintError),
    /// Page content violates an invariant. Fatal.
    Corruption(String),
    /// The master record could not be written after the data pages were.
    /// Fatal: the file still holds the previous commit.
    MasterWrite(std::io::Error),
    /// An earlier fatal error stopped the store.
    Poisoned(String),
    /// The transaction failed earlier and accepts no more work.
    Aborted,
}

impl StoreError {
    /// Whether the store must stop serving requests.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Corruption(_) | Self::MasterWrite(_) | Self::Poisoned(_)
        )
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structural(e) => write!(f, "invalid store file: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Constraint(e) => write!(f, "constraint violated: {e}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::MasterWrite(e) => write!(f, "master record write failed: {e}"),
            Self::Poisoned(reason) => write!(f, "store unusable after fatal error: {reason}"),
            Self::Aborted => write!(f, "transaction aborted by an earlier error"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Structural(e) => Some(e),
            Self::Io(e) | Self::MasterWrite(e) => Some(e),
            Self::Constraint(e) => Some(e),
            Self::Corruption(_) | Self::Poisoned(_) | Self::Aborted => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<MasterError> for StoreError {
    fn from(e: MasterError) -> Self {
        Self::Structural(e)
    }
}

impl From<ConstraintError> for StoreError {
    fn from(e: ConstraintError) -> Self {
        Self::Constraint(e)
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(e) => Self::Io(e),
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<BTreeError> for StoreError {
    fn from(e: BTreeError) -> Self {
        match e {
            BTreeError::Storage(e) => e.into(),
            BTreeError::EmptyKey => Self::Constraint(ConstraintError::EmptyKey),
            other => Self::Corruption(other.to_string()),
        }
    }
}

impl From<FreeListError> for StoreError {
    fn from(e: FreeListError) -> Self {
        match e {
            FreeListError::Storage(e) => e.into(),
            other => Self::Corruption(other.to_string()),
        }
    }
}
