//! Persistent list of reusable pages.
//!
//! The free list is a singly linked list of pages, each holding up to
//! `FREE_LIST_CAPACITY` page numbers:
//!
//! ```text
//! | type: u16 | size: u16 | total: u64 | next: u64 | pointers: size * u64 |
//! ```
//!
//! `total` is the number of free pages in this node and every node after it,
//! so the head's total is the length of the whole list. Item `i` of the list
//! is counted from the end of the head node's pointers and continues into
//! later nodes.
//!
//! A transaction consumes items `0..n` while it runs and hands the pages it
//! released to `update` at commit. `update` drops the consumed items, recycles
//! fully consumed list nodes as free pages, and prepends the released pages.
//! New list nodes go into pages taken from the list itself where possible and
//! are appended to the file otherwise.

use std::collections::HashSet;

use crate::storage::codec::{self, CodecError};
use crate::storage::io::{FreeListPages, PageRead, StorageError};
use crate::storage::page::{PAGE_SIZE, PageId, PageType};

/// Size of the node header.
pub const FREE_LIST_HEADER: usize = 2 + 2 + 8 + 8;

/// Page numbers that fit in one node.
pub const FREE_LIST_CAPACITY: usize = (PAGE_SIZE - FREE_LIST_HEADER) / 8;

/// Node field offsets.
mod offsets {
    pub const TYPE: usize = 0;
    pub const SIZE: usize = 2;
    pub const TOTAL: usize = 4;
    pub const NEXT: usize = 12;
    pub const POINTERS: usize = 20;
}

/// Errors raised by free-list operations.
#[derive(Debug)]
pub enum FreeListError {
    /// A page could not be read or written.
    Storage(StorageError),
    /// A node field lies outside its page.
    Codec(CodecError),
    /// A list page does not carry the free-list type tag.
    InvalidType { page_id: PageId, found: u16 },
    /// Item index past the end of the list.
    IndexOutOfRange { index: u64, total: u64 },
    /// More items consumed than the list holds.
    PopTooMany { popn: u64, total: u64 },
    /// The list structure is inconsistent.
    Corruption(String),
}

impl std::fmt::Display for FreeListError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Codec(e) => write!(f, "malformed free-list node: {e}"),
            Self::InvalidType { page_id, found } => {
                write!(f, "page {page_id} is not a free-list node (type {found})")
            }
            Self::IndexOutOfRange { index, total } => {
                write!(f, "free-list index {index} out of range (total {total})")
            }
            Self::PopTooMany { popn, total } => {
                write!(f, "cannot consume {popn} items from a free list of {total}")
            }
            Self::Corruption(msg) => write!(f, "free-list corruption: {msg}"),
        }
    }
}

impl std::error::Error for FreeListError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for FreeListError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<CodecError> for FreeListError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// A view of one stored list node.
struct ListNode<'a> {
    buf: &'a [u8],
}

impl<'a> ListNode<'a> {
    fn read<P: PageRead + ?Sized>(pages: &'a P, page_id: PageId) -> Result<Self, FreeListError> {
        let buf = pages.read_page(page_id)?;
        let found = codec::read_u16(buf, offsets::TYPE)?;
        if found != PageType::FreeList as u16 {
            return Err(FreeListError::InvalidType { page_id, found });
        }
        let node = Self { buf };
        let size = node.size()?;
        if size == 0 || size > FREE_LIST_CAPACITY {
            return Err(FreeListError::Corruption(format!(
                "node {page_id} holds {size} items"
            )));
        }
        Ok(node)
    }

    fn size(&self) -> Result<usize, FreeListError> {
        Ok(usize::from(codec::read_u16(self.buf, offsets::SIZE)?))
    }

    fn total(&self) -> Result<u64, FreeListError> {
        Ok(codec::read_u64(self.buf, offsets::TOTAL)?)
    }

    fn next(&self) -> Result<PageId, FreeListError> {
        Ok(codec::read_u64(self.buf, offsets::NEXT)?)
    }

    fn ptr(&self, index: usize) -> Result<PageId, FreeListError> {
        Ok(codec::read_u64(self.buf, offsets::POINTERS + 8 * index)?)
    }

    fn pointers(&self) -> Result<Vec<PageId>, FreeListError> {
        (0..self.size()?).map(|i| self.ptr(i)).collect()
    }

    fn encode(pointers: &[PageId], total: u64, next: PageId) -> Result<Vec<u8>, FreeListError> {
        let size = u16::try_from(pointers.len())
            .ok()
            .filter(|&n| usize::from(n) <= FREE_LIST_CAPACITY)
            .ok_or_else(|| {
                FreeListError::Corruption(format!("{} items exceed node capacity", pointers.len()))
            })?;
        let mut buf = vec![0u8; PAGE_SIZE];
        codec::write_u16(&mut buf, offsets::TYPE, PageType::FreeList as u16)?;
        codec::write_u16(&mut buf, offsets::SIZE, size)?;
        codec::write_u64(&mut buf, offsets::TOTAL, total)?;
        codec::write_u64(&mut buf, offsets::NEXT, next)?;
        for (i, ptr) in pointers.iter().enumerate() {
            codec::write_u64(&mut buf, offsets::POINTERS + 8 * i, *ptr)?;
        }
        Ok(buf)
    }
}

/// A decoded list node, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeListNode {
    pub page_id: PageId,
    pub total: u64,
    pub next: PageId,
    pub pointers: Vec<PageId>,
}

/// Handle to the list through its head page. Zero means empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeList {
    head: PageId,
}

impl FreeList {
    #[must_use]
    pub const fn new(head: PageId) -> Self {
        Self { head }
    }

    #[must_use]
    pub const fn head(&self) -> PageId {
        self.head
    }

    /// Number of free pages in the list.
    pub fn total<P: PageRead + ?Sized>(&self, pages: &P) -> Result<u64, FreeListError> {
        if self.head == 0 {
            return Ok(0);
        }
        ListNode::read(pages, self.head)?.total()
    }

    /// The page number at item `index`.
    pub fn get<P: PageRead + ?Sized>(&self, pages: &P, index: u64) -> Result<PageId, FreeListError> {
        let total = self.total(pages)?;
        if index >= total {
            return Err(FreeListError::IndexOutOfRange { index, total });
        }
        let mut remaining = index;
        let mut page_id = self.head;
        loop {
            if page_id == 0 {
                return Err(FreeListError::Corruption(format!(
                    "list ends before item {index} of {total}"
                )));
            }
            let node = ListNode::read(pages, page_id)?;
            let size = node.size()? as u64;
            if remaining < size {
                let slot = usize::try_from(size - remaining - 1)
                    .map_err(|_| FreeListError::Corruption("slot overflow".to_string()))?;
                return node.ptr(slot);
            }
            // size is non-zero, so the walk always makes progress
            remaining -= size;
            page_id = node.next()?;
        }
    }

    /// Drop the first `popn` items and add `freed` pages to the list.
    ///
    /// # Errors
    ///
    /// Returns `PopTooMany` if `popn` exceeds the list length, or a storage
    /// error if a node cannot be read or written.
    pub fn update<P: FreeListPages + ?Sized>(
        &mut self,
        pages: &mut P,
        popn: u64,
        mut freed: Vec<PageId>,
    ) -> Result<(), FreeListError> {
        let mut total = self.total(&*pages)?;
        if popn > total {
            return Err(FreeListError::PopTooMany { popn, total });
        }
        if popn == 0 && freed.is_empty() {
            return Ok(());
        }

        let mut popn = popn;
        let mut reuse: Vec<PageId> = Vec::new();
        while self.head != 0 && (popn > 0 || reuse.len() * FREE_LIST_CAPACITY < freed.len()) {
            let node = ListNode::read(&*pages, self.head)?;
            let size = node.size()?;
            let next = node.next()?;
            let pointers = node.pointers()?;
            freed.push(self.head);

            let size_u64 = size as u64;
            if popn >= size_u64 {
                // every item consumed
                popn -= size_u64;
            } else {
                let mut remain = size - usize::try_from(popn)
                    .map_err(|_| FreeListError::Corruption("pop count overflow".to_string()))?;
                popn = 0;
                // keep enough pages to hold the rewritten list
                while remain > 0 && reuse.len() * FREE_LIST_CAPACITY < freed.len() + remain {
                    remain -= 1;
                    reuse.push(pointers[remain]);
                }
                freed.extend_from_slice(&pointers[..remain]);
            }
            total = total.checked_sub(size_u64).ok_or_else(|| {
                FreeListError::Corruption(format!("node {} overstates list length", self.head))
            })?;
            self.head = next;
        }
        if popn > 0 {
            return Err(FreeListError::Corruption(
                "list shorter than its recorded total".to_string(),
            ));
        }

        let mut reuse = reuse.into_iter();
        total = self.push(pages, &freed, &mut reuse, total)?;
        let leftover: Vec<PageId> = reuse.collect();
        if !leftover.is_empty() {
            self.push(pages, &leftover, &mut std::iter::empty::<PageId>(), total)?;
        }
        Ok(())
    }

    /// Prepend `entries` in node-sized chunks, storing each node in the next
    /// `reuse` page or an appended page. Returns the new list length.
    fn push<P: FreeListPages + ?Sized>(
        &mut self,
        pages: &mut P,
        entries: &[PageId],
        reuse: &mut dyn Iterator<Item = PageId>,
        mut total: u64,
    ) -> Result<u64, FreeListError> {
        for chunk in entries.chunks(FREE_LIST_CAPACITY) {
            total += chunk.len() as u64;
            let node = ListNode::encode(chunk, total, self.head)?;
            self.head = match reuse.next() {
                Some(page_id) => {
                    pages.reuse(page_id, node)?;
                    page_id
                }
                None => pages.append(node)?,
            };
        }
        Ok(total)
    }

    /// Decode every node of the list, head first.
    pub fn nodes<P: PageRead + ?Sized>(&self, pages: &P) -> Result<Vec<FreeListNode>, FreeListError> {
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        let mut page_id = self.head;
        while page_id != 0 {
            if !seen.insert(page_id) {
                return Err(FreeListError::Corruption(format!(
                    "node {page_id} appears twice"
                )));
            }
            let node = ListNode::read(pages, page_id)?;
            let decoded = FreeListNode {
                page_id,
                total: node.total()?,
                next: node.next()?,
                pointers: node.pointers()?,
            };
            page_id = decoded.next;
            nodes.push(decoded);
        }
        Ok(nodes)
    }

    /// Verify that every node's total matches the items that follow it and
    /// that no page appears twice.
    pub fn check<P: PageRead + ?Sized>(&self, pages: &P) -> Result<(), FreeListError> {
        let nodes = self.nodes(pages)?;
        let mut expected = 0u64;
        for node in nodes.iter().rev() {
            expected += node.pointers.len() as u64;
            if node.total != expected {
                return Err(FreeListError::Corruption(format!(
                    "node {} records total {} but {} items follow",
                    node.page_id, node.total, expected
                )));
            }
        }
        let mut seen: HashSet<PageId> = nodes.iter().map(|n| n.page_id).collect();
        for ptr in nodes.iter().flat_map(|n| n.pointers.iter()) {
            if *ptr == 0 || !seen.insert(*ptr) {
                return Err(FreeListError::Corruption(format!(
                    "page {ptr} listed more than once"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::storage::io::PageAlloc;
    use crate::storage::memory::MemoryPages;

    /// Allocate `n` data pages so list entries refer to real slots.
    fn data_pages(pages: &mut MemoryPages, n: usize) -> Vec<PageId> {
        (0..n)
            .map(|_| pages.allocate(vec![0xAA]).expect("allocate"))
            .collect()
    }

    #[test]
    fn test_capacity() {
        assert_eq!(FREE_LIST_CAPACITY, 509);
    }

    #[test]
    fn test_empty_list() {
        let pages = MemoryPages::new();
        let list = FreeList::default();
        assert_eq!(list.total(&pages).expect("total"), 0);
        assert!(matches!(
            list.get(&pages, 0),
            Err(FreeListError::IndexOutOfRange { index: 0, total: 0 })
        ));
        assert!(list.nodes(&pages).expect("nodes").is_empty());
    }

    #[test]
    fn test_push_then_get_from_the_end() {
        let mut pages = MemoryPages::new();
        let freed = data_pages(&mut pages, 3);
        let mut list = FreeList::default();
        list.update(&mut pages, 0, freed.clone()).expect("update");

        assert_eq!(list.total(&pages).expect("total"), 3);
        assert_eq!(list.get(&pages, 0).expect("get"), freed[2]);
        assert_eq!(list.get(&pages, 2).expect("get"), freed[0]);
        list.check(&pages).expect("check");
    }

    #[test]
    fn test_partial_pop_recycles_node_page() {
        let mut pages = MemoryPages::new();
        let freed = data_pages(&mut pages, 3);
        let mut list = FreeList::default();
        list.update(&mut pages, 0, freed.clone()).expect("update");
        let old_head = list.head();

        // items 0 and 1 were handed out; item 2 is still free
        list.update(&mut pages, 2, Vec::new()).expect("pop");
        let nodes = list.nodes(&pages).expect("nodes");
        assert_eq!(nodes.len(), 1);
        // the remaining free page now stores the list, listing the old node page
        assert_eq!(nodes[0].page_id, freed[0]);
        assert_eq!(nodes[0].pointers, vec![old_head]);
        assert_eq!(list.total(&pages).expect("total"), 1);
        list.check(&pages).expect("check");
    }

    #[test]
    fn test_pop_too_many() {
        let mut pages = MemoryPages::new();
        let mut list = FreeList::default();
        assert!(matches!(
            list.update(&mut pages, 1, Vec::new()),
            Err(FreeListError::PopTooMany { popn: 1, total: 0 })
        ));
    }

    #[test]
    fn test_many_entries_span_nodes() {
        let mut pages = MemoryPages::new();
        let freed = data_pages(&mut pages, FREE_LIST_CAPACITY * 2 + 10);
        let mut list = FreeList::default();
        list.update(&mut pages, 0, freed.clone()).expect("update");

        let nodes = list.nodes(&pages).expect("nodes");
        assert_eq!(nodes.len(), 3);
        assert_eq!(list.total(&pages).expect("total"), freed.len() as u64);
        let listed: BTreeSet<PageId> = (0..freed.len() as u64)
            .map(|i| list.get(&pages, i).expect("get"))
            .collect();
        assert_eq!(listed, freed.iter().copied().collect());
        list.check(&pages).expect("check");
    }

    #[test]
    fn test_rejects_foreign_page() {
        let mut pages = MemoryPages::new();
        let id = pages.allocate(vec![2, 0, 1, 0]).expect("allocate");
        let list = FreeList::new(id);
        assert!(matches!(
            list.total(&pages),
            Err(FreeListError::InvalidType { found: 2, .. })
        ));
    }

    #[test]
    fn test_accounting_under_random_rounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut pages = MemoryPages::new();
        let mut list = FreeList::default();
        let mut live: BTreeSet<PageId> = BTreeSet::new();

        for _ in 0..300 {
            let total = list.total(&pages).expect("total");
            let wanted = rng.random_range(0..1200u64);
            let mut popn = 0;
            let mut allocated = Vec::new();
            for _ in 0..wanted {
                let id = if popn < total {
                    let id = list.get(&pages, popn).expect("get");
                    popn += 1;
                    pages.reuse(id, vec![0xBB]).expect("reuse");
                    id
                } else {
                    pages.append(vec![0xBB]).expect("append")
                };
                allocated.push(id);
            }

            let freed: Vec<PageId> = live
                .iter()
                .copied()
                .filter(|_| rng.random_bool(0.3))
                .collect();
            for id in &freed {
                live.remove(id);
            }
            live.extend(allocated);
            list.update(&mut pages, popn, freed).expect("update");

            list.check(&pages).expect("check");
            let nodes = list.nodes(&pages).expect("nodes");
            let node_pages: BTreeSet<PageId> = nodes.iter().map(|n| n.page_id).collect();
            let free_pages: BTreeSet<PageId> =
                nodes.iter().flat_map(|n| n.pointers.iter().copied()).collect();
            assert_eq!(free_pages.len() as u64, list.total(&pages).expect("total"));
            assert!(live.is_disjoint(&node_pages));
            assert!(live.is_disjoint(&free_pages));
            assert_eq!(
                (live.len() + node_pages.len() + free_pages.len()) as u64,
                pages.total_pages() - 1
            );
        }
    }
}
