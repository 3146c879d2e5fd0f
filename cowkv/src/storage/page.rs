//! Page types and constants for the storage engine.
//!
//! Every on-disk structure is exactly one 4KB page. Page 0 holds the master
//! record; all other pages hold B-tree nodes or free-list nodes.

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// The page holding the master record. Never referenced as a node.
pub const MASTER_PAGE: PageId = 0;

/// Largest key accepted by the store, in bytes.
pub const MAX_KEY_SIZE: usize = 1000;

/// Largest value accepted by the store, in bytes.
pub const MAX_VALUE_SIZE: usize = 3000;

/// Page type tag stored in the first two bytes of every node page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PageType {
    /// B-tree internal node: keys plus child pointers.
    Internal = 1,
    /// B-tree leaf node: keys plus values.
    Leaf = 2,
    /// Free-list node: a batch of reusable page numbers.
    FreeList = 3,
}

impl TryFrom<u16> for PageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            3 => Ok(Self::FreeList),
            _ => Err(value),
        }
    }
}

/// Byte offset of a page within the file.
#[must_use]
pub const fn page_offset(id: PageId) -> u64 {
    id * PAGE_SIZE_U64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_roundtrip() {
        for ty in [PageType::Internal, PageType::Leaf, PageType::FreeList] {
            assert_eq!(PageType::try_from(ty as u16), Ok(ty));
        }
        assert_eq!(PageType::try_from(0), Err(0));
        assert_eq!(PageType::try_from(9), Err(9));
    }

    #[test]
    fn test_largest_entry_fits_one_page() {
        // header + pointer + offset + kv lengths + key + value
        let largest = 4 + 8 + 2 + 4 + MAX_KEY_SIZE + MAX_VALUE_SIZE;
        assert!(largest <= PAGE_SIZE);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(page_offset(0), 0);
        assert_eq!(page_offset(3), 3 * PAGE_SIZE_U64);
    }
}
