//! Copy-on-write key-value storage engine.
//!
//! A store is a single file of fixed 4 KiB pages holding a B+tree.
//!
//! # File Format
//!
//! - Page 0: master record (signature, root page, flushed page count,
//!   free-list head, checksum)
//! - Remaining pages: tree nodes, free-list nodes and free pages
//!
//! Writes never touch a live page. A commit first writes and syncs the new
//! pages, then replaces the master record, so a crash between the two leaves
//! the previous tree intact.
//!
//! # Usage
//!
//! ```no_run
//! use cowkv::storage::{Comparator, Store};
//!
//! # fn main() -> Result<(), cowkv::storage::StoreError> {
//! let mut store = Store::open(std::path::Path::new("data.cowkv"))?;
//! store.upsert(b"hello", b"world")?;
//!
//! let mut txn = store.begin()?;
//! txn.insert(b"a", b"1")?;
//! txn.insert(b"b", b"2")?;
//! txn.commit()?;
//!
//! for entry in store.scan((b"a".as_slice(), Comparator::GreaterOrEqual), None)? {
//!     let (key, value) = entry?;
//!     println!("{key:?} = {value:?}");
//! }
//! store.close()?;
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod codec;
pub mod fault;
pub mod freelist;
pub mod io;
pub mod iter;
pub mod master;
pub mod memory;
pub mod mmap;
pub mod page;
pub mod pager;
pub mod store;
pub mod transaction;

pub use btree::{BTree, BTreeError, Comparator, Cursor, Scan};
pub use fault::{FaultConfig, FaultStats};
pub use freelist::{FreeList, FreeListError};
pub use io::{FreeListPages, PageAlloc, PageRead, StorageError};
pub use iter::{StoreCursor, StoreScan};
pub use master::{MasterError, MasterRecord};
pub use memory::MemoryPages;
pub use page::{MAX_KEY_SIZE, MAX_VALUE_SIZE, PAGE_SIZE, PageId};
pub use pager::Pager;
pub use store::{ConstraintError, SetMode, Store, StoreError, StoreOptions, StoreStats};
pub use transaction::Transaction;
