// Test code may use expect() for convenience.
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

// Layers, bottom to top:
//  - codec, page: byte layout of pages
//  - btree: copy-on-write tree over a page capability
//  - freelist: recycled page numbers, stored in pages
//  - mmap, master, pager: the file, its master record, two-phase commit
//  - store, transaction: the public key-value interface

pub mod config;
pub mod storage;
pub mod testing;
