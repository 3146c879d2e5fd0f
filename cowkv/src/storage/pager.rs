//! Page store: pending pages, allocation, and the two-phase commit.
//!
//! Committed pages are read through the memory mapping. Pages written by the
//! running transaction live in a pending table keyed by page number, where a
//! `None` entry marks a page released by the tree. Reads consult the pending
//! table first, so a transaction sees its own writes.
//!
//! A commit runs in two phases:
//! 1. Data phase: released pages and consumed free-list items go through
//!    `FreeList::update`, the file and mapping grow to cover every new page,
//!    pending pages are copied into the mapping, and the data is synced. Any
//!    failure rolls the in-memory state back to the last commit; the master
//!    record on disk still names the old tree, whose pages were not touched.
//! 2. Master phase: the master record is written with one positional write
//!    and synced. A failure here leaves the new pages on disk unreferenced
//!    and the process state ahead of the file, so the pager is poisoned.

use std::cell::OnceCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::storage::fault::{CommitPhase, FaultInjector, FaultStats};
use crate::storage::freelist::{FreeList, FreeListError};
use crate::storage::io::{FreeListPages, PageAlloc, PageRead, StorageError, into_full_page};
use crate::storage::master::{MasterError, MasterRecord};
use crate::storage::mmap::MappedChunks;
use crate::storage::page::{MASTER_PAGE, PAGE_SIZE_U64, PageId};
use crate::storage::store::{StoreError, StoreOptions};

/// Counters kept across the pager's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagerCounters {
    /// Successful commits.
    pub commits: u64,
    /// Transactions rolled back, explicitly or after a failed data phase.
    pub rollbacks: u64,
    /// Pages allocated from the free list.
    pub pages_reused: u64,
    /// Pages allocated past the end of the committed file.
    pub pages_appended: u64,
}

/// The on-disk page store.
pub struct Pager {
    path: PathBuf,
    file: File,
    mmap: MappedChunks,
    /// Length of the file in pages.
    file_pages: u64,
    /// The last record written to page 0.
    committed: MasterRecord,
    committed_free_total: u64,
    /// Working state of the current transaction.
    root: PageId,
    flushed: u64,
    free: FreeList,
    free_total: u64,
    pending: HashMap<PageId, Option<Vec<u8>>>,
    /// Free-list items consumed by the current transaction.
    nfree: u64,
    /// Pages appended by the current transaction.
    nappend: u64,
    resident: Option<HashMap<PageId, Vec<u8>>>,
    faults: FaultInjector,
    counters: PagerCounters,
    poisoned: OnceCell<String>,
}

impl Pager {
    /// Open or create the store file at `path`.
    ///
    /// An empty file is initialised with the master record of an empty tree
    /// before anything else happens.
    ///
    /// # Errors
    ///
    /// Returns `Structural` if the master record is invalid or the file
    /// length is not a whole number of pages, and `Io` if the file cannot be
    /// opened, initialised or mapped.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut size = file.metadata()?.len();
        if size == 0 {
            write_at(&file, &MasterRecord::empty().to_page(), 0)?;
            file.sync_all()?;
            size = PAGE_SIZE_U64;
            tracing::info!(path = %path.display(), "created store file");
        }
        if size % PAGE_SIZE_U64 != 0 {
            return Err(StoreError::Structural(MasterError::UnalignedFile { size }));
        }
        let file_pages = size / PAGE_SIZE_U64;

        let mmap = MappedChunks::map(&file, options.initial_mmap_bytes, size)?;
        let page0 = mmap
            .page(MASTER_PAGE)
            .ok_or_else(|| StoreError::Corruption("master page is not mapped".to_string()))?;
        let committed = MasterRecord::decode(page0).map_err(StoreError::Structural)?;
        committed
            .validate(file_pages)
            .map_err(StoreError::Structural)?;

        let resident = if options.rehydrate_on_open {
            let mut pages = HashMap::new();
            for id in 1..committed.flushed {
                let page = mmap.page(id).ok_or(StorageError::PageOutOfBounds {
                    page_id: id,
                    total_pages: committed.flushed,
                })?;
                pages.insert(id, page.to_vec());
            }
            Some(pages)
        } else {
            None
        };

        if options.faults.is_enabled() {
            tracing::warn!(faults = ?options.faults, "fault injection enabled");
        }

        let mut pager = Self {
            path: path.to_path_buf(),
            file,
            mmap,
            file_pages,
            committed,
            committed_free_total: 0,
            root: committed.root,
            flushed: committed.flushed,
            free: FreeList::new(committed.free_head),
            free_total: 0,
            pending: HashMap::new(),
            nfree: 0,
            nappend: 0,
            resident,
            faults: FaultInjector::new(options.faults),
            counters: PagerCounters::default(),
            poisoned: OnceCell::new(),
        };
        pager.free_total = pager.free.total(&pager)?;
        pager.committed_free_total = pager.free_total;

        tracing::info!(
            path = %pager.path.display(),
            flushed = pager.flushed,
            root = pager.root,
            free = pager.free_total,
            "opened store"
        );
        Ok(pager)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root of the working tree.
    #[must_use]
    pub const fn root(&self) -> PageId {
        self.root
    }

    pub const fn set_root(&mut self, root: PageId) {
        self.root = root;
    }

    /// The record currently on disk.
    #[must_use]
    pub const fn committed(&self) -> MasterRecord {
        self.committed
    }

    /// Pages holding committed data, including page 0.
    #[must_use]
    pub const fn flushed(&self) -> u64 {
        self.flushed
    }

    #[must_use]
    pub const fn file_pages(&self) -> u64 {
        self.file_pages
    }

    #[must_use]
    pub const fn free_list(&self) -> FreeList {
        self.free
    }

    /// Free pages recorded in the list as of the last commit.
    #[must_use]
    pub const fn free_total(&self) -> u64 {
        self.free_total
    }

    #[must_use]
    pub fn pending_pages(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.mmap.mapped_bytes()
    }

    #[must_use]
    pub fn mmap_chunks(&self) -> usize {
        self.mmap.chunk_count()
    }

    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.resident.as_ref().map_or(0, HashMap::len)
    }

    #[must_use]
    pub const fn counters(&self) -> PagerCounters {
        self.counters
    }

    #[must_use]
    pub const fn fault_stats(&self) -> FaultStats {
        self.faults.stats()
    }

    /// Refuse further work after a fatal error.
    pub fn check_usable(&self) -> Result<(), StoreError> {
        match self.poisoned.get() {
            Some(reason) => Err(StoreError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    /// Record a fatal error. Only the first reason is kept.
    pub fn poison(&self, reason: String) {
        if self.poisoned.set(reason).is_ok() {
            tracing::error!(
                path = %self.path.display(),
                reason = self.poisoned.get().map_or("", String::as_str),
                "store poisoned"
            );
        }
    }

    /// Poison the pager if `result` carries a fatal error.
    pub fn observe<T, E: Into<StoreError>>(&self, result: Result<T, E>) -> Result<T, StoreError> {
        result.map_err(|e| {
            let e = e.into();
            if e.is_fatal() {
                self.poison(e.to_string());
            }
            e
        })
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }

    /// Discard the current transaction.
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() || self.root != self.committed.root {
            self.counters.rollbacks += 1;
        }
        self.root = self.committed.root;
        self.flushed = self.committed.flushed;
        self.free = FreeList::new(self.committed.free_head);
        self.free_total = self.committed_free_total;
        self.pending.clear();
        self.nfree = 0;
        self.nappend = 0;
    }

    /// Make the current transaction durable.
    ///
    /// Does nothing if the transaction wrote no pages.
    ///
    /// # Errors
    ///
    /// A data-phase failure rolls the transaction back and returns the
    /// error. A master-phase failure poisons the pager and returns
    /// `MasterWrite`.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.check_usable()?;
        if self.pending.is_empty() {
            return Ok(());
        }

        let reused = self.nfree;
        let free_total = match self.write_data_pages() {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(error = %e, "data phase failed, rolling back");
                self.rollback();
                if e.is_fatal() {
                    self.poison(e.to_string());
                }
                return Err(e);
            }
        };

        self.flushed += self.nappend;
        self.counters.pages_reused += reused;
        self.counters.pages_appended += self.nappend;
        self.free_total = free_total;
        self.pending.clear();
        self.nfree = 0;
        self.nappend = 0;

        let record = MasterRecord {
            root: self.root,
            flushed: self.flushed,
            free_head: self.free.head(),
        };
        if let Err(e) = self.write_master(&record) {
            self.poison(format!("master write failed: {e}"));
            return Err(StoreError::MasterWrite(e));
        }
        self.committed = record;
        self.committed_free_total = free_total;
        self.counters.commits += 1;
        tracing::debug!(
            root = record.root,
            flushed = record.flushed,
            free_head = record.free_head,
            free = free_total,
            "committed"
        );
        Ok(())
    }

    /// Data phase. Returns the new free-list length.
    fn write_data_pages(&mut self) -> Result<u64, StoreError> {
        let mut freed: Vec<PageId> = self
            .pending
            .iter()
            .filter(|(_, page)| page.is_none())
            .map(|(id, _)| *id)
            .collect();
        freed.sort_unstable();
        let freed_count = freed.len();

        let popn = self.nfree;
        let mut free = self.free;
        free.update(self, popn, freed)?;
        self.free = free;
        let free_total = self.free.total(&*self)?;

        let npages = self.flushed + self.nappend;
        self.extend_file(npages)?;
        let added = self.mmap.ensure(&self.file, npages * PAGE_SIZE_U64)?;
        if added > 0 {
            tracing::debug!(
                chunks = self.mmap.chunk_count(),
                bytes = self.mmap.mapped_bytes(),
                "mapping extended for commit"
            );
        }

        let mut written = 0usize;
        for (id, page) in &self.pending {
            let Some(page) = page else { continue };
            if *id == MASTER_PAGE {
                continue;
            }
            let target = self.mmap.page_mut(*id).ok_or(StorageError::PageOutOfBounds {
                page_id: *id,
                total_pages: npages,
            })?;
            target.copy_from_slice(page);
            if let Some(resident) = &mut self.resident {
                resident.insert(*id, page.clone());
            }
            written += 1;
        }

        if self.faults.should_fail(CommitPhase::Data) {
            return Err(StoreError::Io(io::Error::other(
                "injected fault while writing data pages",
            )));
        }
        self.mmap.flush()?;
        self.file.sync_all()?;

        tracing::debug!(
            written,
            freed = freed_count,
            reused = self.nfree,
            appended = self.nappend,
            flushed = npages,
            "data phase complete"
        );
        Ok(free_total)
    }

    /// Grow the file to at least `npages`, by an eighth of its size at a time.
    fn extend_file(&mut self, npages: u64) -> io::Result<()> {
        if npages <= self.file_pages {
            return Ok(());
        }
        let mut pages = self.file_pages.max(1);
        while pages < npages {
            pages += (pages / 8).max(1);
        }
        self.file.set_len(pages * PAGE_SIZE_U64)?;
        tracing::debug!(from = self.file_pages, to = pages, "extended file");
        self.file_pages = pages;
        Ok(())
    }

    /// Master phase.
    fn write_master(&mut self, record: &MasterRecord) -> io::Result<()> {
        if self.faults.should_fail(CommitPhase::Master) {
            return Err(io::Error::other("injected fault while writing master record"));
        }
        write_at(&self.file, &record.encode(), 0)?;
        self.file.sync_all()
    }

    /// Commit anything outstanding, rewrite the master record, and release
    /// the mapping and file.
    ///
    /// # Errors
    ///
    /// Returns `Poisoned` without touching the file if an earlier fatal
    /// error occurred.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.check_usable()?;
        self.commit()?;
        self.mmap.flush()?;
        self.file.sync_all()?;
        let record = self.committed;
        self.write_master(&record)
            .map_err(StoreError::MasterWrite)?;
        tracing::info!(
            path = %self.path.display(),
            flushed = record.flushed,
            root = record.root,
            "closed store"
        );
        Ok(())
    }
}

impl PageRead for Pager {
    fn read_page(&self, id: PageId) -> Result<&[u8], StorageError> {
        if id == MASTER_PAGE {
            return Err(StorageError::MasterPageAccess);
        }
        if let Some(entry) = self.pending.get(&id) {
            return entry.as_deref().ok_or(StorageError::Released(id));
        }
        let out_of_bounds = StorageError::PageOutOfBounds {
            page_id: id,
            total_pages: self.flushed,
        };
        if id >= self.flushed {
            return Err(out_of_bounds);
        }
        if let Some(page) = self.resident.as_ref().and_then(|r| r.get(&id)) {
            return Ok(page);
        }
        self.mmap.page(id).ok_or(out_of_bounds)
    }
}

impl PageAlloc for Pager {
    fn allocate(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        let page = into_full_page(page)?;
        let id = if self.nfree < self.free_total {
            let id = self
                .free
                .get(&*self, self.nfree)
                .map_err(free_list_storage_error)?;
            self.nfree += 1;
            id
        } else {
            let id = self.flushed + self.nappend;
            self.nappend += 1;
            id
        };
        self.pending.insert(id, Some(page));
        Ok(id)
    }

    fn release(&mut self, id: PageId) -> Result<(), StorageError> {
        if id == MASTER_PAGE {
            return Err(StorageError::MasterPageAccess);
        }
        let total_pages = self.flushed + self.nappend;
        if id >= total_pages {
            return Err(StorageError::PageOutOfBounds {
                page_id: id,
                total_pages,
            });
        }
        self.pending.insert(id, None);
        Ok(())
    }
}

impl FreeListPages for Pager {
    fn append(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        let page = into_full_page(page)?;
        let id = self.flushed + self.nappend;
        self.nappend += 1;
        self.pending.insert(id, Some(page));
        Ok(id)
    }

    fn reuse(&mut self, id: PageId, page: Vec<u8>) -> Result<(), StorageError> {
        if id == MASTER_PAGE {
            return Err(StorageError::MasterPageAccess);
        }
        self.pending.insert(id, Some(into_full_page(page)?));
        Ok(())
    }
}

fn free_list_storage_error(e: FreeListError) -> StorageError {
    match e {
        FreeListError::Storage(inner) => inner,
        other => StorageError::Corruption(other.to_string()),
    }
}

#[cfg(unix)]
fn write_at(file: &File, bytes: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(bytes, offset)
}

#[cfg(not(unix))]
fn write_at(mut file: &File, bytes: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)
}
