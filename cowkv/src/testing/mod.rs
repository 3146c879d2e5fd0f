use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::page::PAGE_SIZE_U64;
use crate::storage::{Store, StoreError, StoreOptions};

static TEST_STORE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A unique store path in the system temp directory.
///
/// Any file left at the path by a previous run is removed.
#[must_use]
pub fn test_store_path() -> PathBuf {
    let counter = TEST_STORE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_name = format!("cowkv_test_{}_{}.cowkv", std::process::id(), counter);
    let path = std::env::temp_dir().join(unique_name);

    // Remove if it exists from a previous run
    let _ = std::fs::remove_file(&path);
    path
}

/// Options with a small first mapping, so tests exercise mapping growth.
#[must_use]
pub fn test_store_options() -> StoreOptions {
    StoreOptions::default().with_initial_mmap_bytes(16 * PAGE_SIZE_U64)
}

/// Create a new test store using a temporary file.
///
/// The store file is not automatically cleaned up; tests should be run in a
/// clean environment or clean up manually if needed.
pub fn new_test_store() -> Result<Store, StoreError> {
    Store::open_with(&test_store_path(), &test_store_options())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_test_store_is_empty() {
        let store = new_test_store().expect("create store");
        let stats = store.stats().expect("stats");
        assert_eq!(stats.root, 0);
        assert_eq!(stats.flushed, 1);
        let path = store.path().to_path_buf();
        store.close().expect("close");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_paths_are_unique() {
        assert_ne!(test_store_path(), test_store_path());
    }
}
