//! In-memory page capability for unit tests and tooling.
//!
//! Pages live in a vector indexed by page number. Page 0 is reserved so page
//! numbers line up with the on-disk layout. Released pages become holes and
//! are reported through `take_released` so callers can feed them to a free
//! list the same way the pager does at commit.

use crate::storage::io::{FreeListPages, PageAlloc, PageRead, StorageError, into_full_page};
use crate::storage::page::{MASTER_PAGE, PageId};

/// Vector-backed pages.
#[derive(Debug, Default)]
pub struct MemoryPages {
    pages: Vec<Option<Vec<u8>>>,
    released: Vec<PageId>,
}

impl MemoryPages {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: vec![None],
            released: Vec::new(),
        }
    }

    /// Number of page slots, including the reserved master slot and holes.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.pages.len() as u64
    }

    /// Number of pages currently holding content.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.pages.iter().skip(1).filter(|p| p.is_some()).count()
    }

    /// Drain the pages released since the last call.
    pub fn take_released(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.released)
    }

    fn slot(&self, id: PageId) -> Result<usize, StorageError> {
        if id == MASTER_PAGE {
            return Err(StorageError::MasterPageAccess);
        }
        usize::try_from(id)
            .ok()
            .filter(|&index| index < self.pages.len())
            .ok_or(StorageError::PageOutOfBounds {
                page_id: id,
                total_pages: self.total_pages(),
            })
    }

    fn push(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        let page = into_full_page(page)?;
        self.pages.push(Some(page));
        Ok(self.total_pages() - 1)
    }
}

impl PageRead for MemoryPages {
    fn read_page(&self, id: PageId) -> Result<&[u8], StorageError> {
        let index = self.slot(id)?;
        self.pages[index]
            .as_deref()
            .ok_or(StorageError::Released(id))
    }
}

impl PageAlloc for MemoryPages {
    fn allocate(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        self.push(page)
    }

    fn release(&mut self, id: PageId) -> Result<(), StorageError> {
        let index = self.slot(id)?;
        if self.pages[index].take().is_none() {
            return Err(StorageError::Released(id));
        }
        self.released.push(id);
        Ok(())
    }
}

impl FreeListPages for MemoryPages {
    fn append(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        self.push(page)
    }

    fn reuse(&mut self, id: PageId, page: Vec<u8>) -> Result<(), StorageError> {
        let index = self.slot(id)?;
        self.pages[index] = Some(into_full_page(page)?);
        Ok(())
    }
}
