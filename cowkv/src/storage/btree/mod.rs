//! Copy-on-write B+tree for the storage engine.
//!
//! # Structure
//!
//! - `node`: page layout of internal and leaf nodes plus the structural
//!   edits (insert, update, remove, split, merge) that produce new nodes
//! - `tree`: point reads, inserts and deletes through a page capability
//! - `cursor`: ordered traversal and bounded range scans
//!
//! # Usage
//!
//! ```
//! use cowkv::storage::btree::BTree;
//! use cowkv::storage::MemoryPages;
//!
//! let mut pages = MemoryPages::new();
//! let mut tree = BTree::new(&mut pages, 0);
//! tree.insert(b"k1", b"hi").unwrap();
//! assert_eq!(tree.get(b"k1").unwrap(), Some(&b"hi"[..]));
//! ```

mod cursor;
mod node;
mod tree;

pub use cursor::{Comparator, Cursor, Scan};
pub use node::{HEADER_SIZE, Node, NodeError, NodeRef};
pub use tree::{BTree, BTreeError, MAX_HEIGHT};
