//! Read-only view of committed pages through memory-mapped chunks.
//!
//! The file is mapped as a list of chunks. The first chunk covers at least
//! the whole file at open time; each later chunk maps the region right after
//! the previous ones and is as large as everything mapped so far, so the
//! mapped range doubles on every extension. Existing chunks are never
//! remapped, which keeps slices handed out by `page` valid until the next
//! `&mut` call.
//!
//! Mappings may extend past the end of the file. Only pages below the
//! committed page count are ever touched, and the file is extended before
//! any page beyond its old end is written.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;

use memmap2::{MmapMut, MmapOptions};

use crate::storage::page::{PAGE_SIZE, PAGE_SIZE_U64, PageId, page_offset};

/// Memory-mapped chunks over a database file.
pub struct MappedChunks {
    chunks: Vec<MmapMut>,
    mapped: u64,
}

impl MappedChunks {
    /// Map `file`, starting from `initial_bytes` and doubling until the
    /// mapping covers `file_size`.
    pub fn map(file: &File, initial_bytes: u64, file_size: u64) -> io::Result<Self> {
        if initial_bytes == 0 || initial_bytes % PAGE_SIZE_U64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("initial mapping of {initial_bytes} bytes is not a multiple of {PAGE_SIZE}"),
            ));
        }
        let mut len = initial_bytes;
        while len < file_size {
            len = len
                .checked_mul(2)
                .ok_or_else(|| io::Error::other("mapping size overflow"))?;
        }
        let chunk = map_range(file, 0, len)?;
        tracing::debug!(bytes = len, "mapped database file");
        Ok(Self {
            chunks: vec![chunk],
            mapped: len,
        })
    }

    /// Add chunks until at least `bytes` are mapped. Returns the number of
    /// chunks added.
    pub fn ensure(&mut self, file: &File, bytes: u64) -> io::Result<usize> {
        let mut added = 0;
        while self.mapped < bytes {
            let len = self.mapped;
            let chunk = map_range(file, self.mapped, len)?;
            self.chunks.push(chunk);
            self.mapped += len;
            added += 1;
            tracing::debug!(
                bytes = self.mapped,
                chunks = self.chunks.len(),
                "extended mapping"
            );
        }
        Ok(added)
    }

    /// Locate the chunk holding `id` and the byte offset inside it.
    fn locate(&self, id: PageId) -> Option<(usize, usize)> {
        let offset = page_offset(id);
        let mut start = 0u64;
        for (index, chunk) in self.chunks.iter().enumerate() {
            let end = start + chunk.len() as u64;
            if offset < end {
                let at = usize::try_from(offset - start).ok()?;
                return Some((index, at));
            }
            start = end;
        }
        None
    }

    pub fn page(&self, id: PageId) -> Option<&[u8]> {
        let (index, at) = self.locate(id)?;
        self.chunks[index].get(at..at + PAGE_SIZE)
    }

    pub fn page_mut(&mut self, id: PageId) -> Option<&mut [u8]> {
        let (index, at) = self.locate(id)?;
        self.chunks[index].get_mut(at..at + PAGE_SIZE)
    }

    /// Write dirty mapped pages back to the file.
    pub fn flush(&self) -> io::Result<()> {
        for chunk in &self.chunks {
            chunk.flush()?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.mapped
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

fn map_range(file: &File, offset: u64, len: u64) -> io::Result<MmapMut> {
    let len = usize::try_from(len).map_err(|_| io::Error::other("mapping too large"))?;
    // SAFETY: MmapOptions::map_mut is unsafe because the mapped file could be
    // modified externally, leading to undefined behavior. This is safe because:
    // 1. The store is the single writer of the file and holds it open read+write
    // 2. Only pages below the committed page count are read, and those lie
    //    inside the file
    // 3. Chunks are owned by MappedChunks, so slices cannot outlive the mapping
    // 4. `offset` is a multiple of the initial mapping size, itself a multiple
    //    of the page size
    unsafe { MmapOptions::new().offset(offset).len(len).map_mut(file) }
}
