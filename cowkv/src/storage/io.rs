//! Page capabilities handed to the B-tree and free list.
//!
//! Neither the tree nor the free list knows where pages live. They receive a
//! small capability object instead:
//! - `PageRead` dereferences a page number into a byte slice
//! - `PageAlloc` adds allocation and release for B-tree nodes
//! - `FreeListPages` adds the two free-list specific writes: appending a brand
//!   new page at the end of the file and overwriting a recycled page in place
//!
//! The on-disk pager implements all three. `MemoryPages` implements them over
//! a plain vector so tree and free-list logic can be tested without a file.

use crate::storage::page::{PAGE_SIZE, PageId};

/// Errors that can occur while resolving or writing pages.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// Page out of bounds.
    PageOutOfBounds { page_id: PageId, total_pages: u64 },
    /// The page was released earlier in the current transaction.
    Released(PageId),
    /// A buffer larger than one page was handed to the allocator.
    PageTooLarge(usize),
    /// The master page was addressed as a node.
    MasterPageAccess,
    /// Corruption detected.
    Corruption(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::PageOutOfBounds {
                page_id,
                total_pages,
            } => write!(
                f,
                "page {page_id} out of bounds (total pages: {total_pages})"
            ),
            Self::Released(page_id) => write!(f, "page {page_id} was released"),
            Self::PageTooLarge(len) => {
                write!(f, "buffer of {len} bytes exceeds page size {PAGE_SIZE}")
            }
            Self::MasterPageAccess => write!(f, "page 0 is reserved for the master record"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read access to pages by number.
pub trait PageRead {
    /// Resolve a page number to its current content.
    ///
    /// Pages written in the current transaction are returned in preference
    /// to their committed content.
    fn read_page(&self, id: PageId) -> Result<&[u8], StorageError>;
}

/// Allocation capability used by the B-tree.
pub trait PageAlloc: PageRead {
    /// Store a new node and return its page number.
    ///
    /// The buffer must not exceed one page; shorter buffers are zero padded.
    fn allocate(&mut self, page: Vec<u8>) -> Result<PageId, StorageError>;

    /// Mark a page as no longer referenced by the tree.
    fn release(&mut self, id: PageId) -> Result<(), StorageError>;
}

/// Write capability used by the free list when it rewrites its own nodes.
pub trait FreeListPages: PageRead {
    /// Store a node in a page past the current end of the file.
    fn append(&mut self, page: Vec<u8>) -> Result<PageId, StorageError>;

    /// Overwrite a page that was just taken off the free list.
    fn reuse(&mut self, id: PageId, page: Vec<u8>) -> Result<(), StorageError>;
}

impl<T: PageRead + ?Sized> PageRead for &T {
    fn read_page(&self, id: PageId) -> Result<&[u8], StorageError> {
        (**self).read_page(id)
    }
}

impl<T: PageRead + ?Sized> PageRead for &mut T {
    fn read_page(&self, id: PageId) -> Result<&[u8], StorageError> {
        (**self).read_page(id)
    }
}

impl<T: PageAlloc + ?Sized> PageAlloc for &mut T {
    fn allocate(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        (**self).allocate(page)
    }

    fn release(&mut self, id: PageId) -> Result<(), StorageError> {
        (**self).release(id)
    }
}

impl<T: FreeListPages + ?Sized> FreeListPages for &mut T {
    fn append(&mut self, page: Vec<u8>) -> Result<PageId, StorageError> {
        (**self).append(page)
    }

    fn reuse(&mut self, id: PageId, page: Vec<u8>) -> Result<(), StorageError> {
        (**self).reuse(id, page)
    }
}

/// Pad a node buffer to exactly one page.
///
/// # Errors
///
/// Returns `PageTooLarge` if the buffer is longer than a page.
pub fn into_full_page(mut page: Vec<u8>) -> Result<Vec<u8>, StorageError> {
    if page.len() > PAGE_SIZE {
        return Err(StorageError::PageTooLarge(page.len()));
    }
    page.resize(PAGE_SIZE, 0);
    Ok(page)
}
