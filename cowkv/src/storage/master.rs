//! Master record: the root of everything durable.
//!
//! The first bytes of page 0 hold the only mutable on-disk state:
//!
//! ```text
//! | signature: 16 | root: u64 | flushed: u64 | free head: u64 | crc32: u32 |
//! ```
//!
//! Replacing this record is the commit point of a transaction. The checksum
//! covers the 40 bytes before it.

use crate::storage::codec::{self, CodecError};
use crate::storage::page::{PAGE_SIZE, PageId};

/// File signature: "cowkv-pages-0001"
pub const SIGNATURE: [u8; 16] = *b"cowkv-pages-0001";

/// Bytes of page 0 covered by the record.
pub const RECORD_SIZE: usize = 44;

/// Master record field offsets.
mod offsets {
    pub const SIGNATURE: usize = 0;
    pub const ROOT: usize = 16;
    pub const FLUSHED: usize = 24;
    pub const FREE_HEAD: usize = 32;
    pub const CHECKSUM: usize = 40;
}

/// Errors raised while decoding or validating the master record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    /// The record is truncated.
    Codec(CodecError),
    /// The file does not start with the signature.
    InvalidSignature([u8; 16]),
    /// The record checksum does not match.
    ChecksumMismatch { stored: u32, computed: u32 },
    /// The file length is not a whole number of pages.
    UnalignedFile { size: u64 },
    /// The flushed page count lies outside `1..=file_pages`.
    FlushedOutOfRange { flushed: u64, file_pages: u64 },
    /// The root page lies past the flushed pages.
    RootOutOfRange { root: PageId, flushed: u64 },
    /// The free-list head lies past the flushed pages.
    FreeHeadOutOfRange { head: PageId, flushed: u64 },
}

impl std::fmt::Display for MasterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "truncated master record: {e}"),
            Self::InvalidSignature(found) => {
                write!(f, "invalid signature: {:?}", String::from_utf8_lossy(found))
            }
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "master checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            ),
            Self::UnalignedFile { size } => {
                write!(f, "file size {size} is not a multiple of {PAGE_SIZE}")
            }
            Self::FlushedOutOfRange {
                flushed,
                file_pages,
            } => write!(
                f,
                "flushed page count {flushed} outside 1..={file_pages}"
            ),
            Self::RootOutOfRange { root, flushed } => {
                write!(f, "root page {root} beyond flushed pages {flushed}")
            }
            Self::FreeHeadOutOfRange { head, flushed } => {
                write!(f, "free-list head {head} beyond flushed pages {flushed}")
            }
        }
    }
}

impl std::error::Error for MasterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for MasterError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// The committed tree root, flushed page count and free-list head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterRecord {
    /// Root page of the B-tree. Zero for an empty tree.
    pub root: PageId,
    /// Number of pages that hold committed data, including page 0.
    pub flushed: u64,
    /// Head page of the free list. Zero for an empty list.
    pub free_head: PageId,
}

impl Default for MasterRecord {
    fn default() -> Self {
        Self::empty()
    }
}

impl MasterRecord {
    /// The record of a freshly created store.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            root: 0,
            flushed: 1,
            free_head: 0,
        }
    }

    /// Serialize to the bytes written at the start of page 0.
    #[must_use]
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[offsets::SIGNATURE..offsets::ROOT].copy_from_slice(&SIGNATURE);
        buf[offsets::ROOT..offsets::FLUSHED].copy_from_slice(&self.root.to_le_bytes());
        buf[offsets::FLUSHED..offsets::FREE_HEAD].copy_from_slice(&self.flushed.to_le_bytes());
        buf[offsets::FREE_HEAD..offsets::CHECKSUM].copy_from_slice(&self.free_head.to_le_bytes());
        let checksum = crc32fast::hash(&buf[..offsets::CHECKSUM]);
        buf[offsets::CHECKSUM..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// A full page 0 for a new file.
    #[must_use]
    pub fn to_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[..RECORD_SIZE].copy_from_slice(&self.encode());
        page
    }

    /// Decode the record from the start of page 0.
    pub fn decode(buf: &[u8]) -> Result<Self, MasterError> {
        let signature = codec::slice(buf, offsets::SIGNATURE, SIGNATURE.len())?;
        if signature != SIGNATURE {
            let mut found = [0u8; 16];
            found.copy_from_slice(signature);
            return Err(MasterError::InvalidSignature(found));
        }
        let stored = codec::read_u32(buf, offsets::CHECKSUM)?;
        let computed = crc32fast::hash(codec::slice(buf, 0, offsets::CHECKSUM)?);
        if stored != computed {
            return Err(MasterError::ChecksumMismatch { stored, computed });
        }
        Ok(Self {
            root: codec::read_u64(buf, offsets::ROOT)?,
            flushed: codec::read_u64(buf, offsets::FLUSHED)?,
            free_head: codec::read_u64(buf, offsets::FREE_HEAD)?,
        })
    }

    /// Check the record against a file of `file_pages` pages.
    pub const fn validate(&self, file_pages: u64) -> Result<(), MasterError> {
        if self.flushed < 1 || self.flushed > file_pages {
            return Err(MasterError::FlushedOutOfRange {
                flushed: self.flushed,
                file_pages,
            });
        }
        if self.root >= self.flushed {
            return Err(MasterError::RootOutOfRange {
                root: self.root,
                flushed: self.flushed,
            });
        }
        if self.free_head >= self.flushed {
            return Err(MasterError::FreeHeadOutOfRange {
                head: self.free_head,
                flushed: self.flushed,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_roundtrip() {
        let record = MasterRecord {
            root: 7,
            flushed: 12,
            free_head: 3,
        };
        let page = record.to_page();
        assert_eq!(page.len(), PAGE_SIZE);
        assert_eq!(&page[..16], b"cowkv-pages-0001");
        let decoded = MasterRecord::decode(&page).expect("decode");
        assert_eq!(decoded, record);
        decoded.validate(12).expect("validate");
    }

    #[test]
    fn test_invalid_signature() {
        let mut page = MasterRecord::empty().to_page();
        page[0] = b'X';
        assert!(matches!(
            MasterRecord::decode(&page),
            Err(MasterError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_checksum_detects_torn_record() {
        let mut page = MasterRecord::empty().to_page();
        page[offsets::ROOT] ^= 0x01;
        assert!(matches!(
            MasterRecord::decode(&page),
            Err(MasterError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_ranges() {
        let record = MasterRecord {
            root: 5,
            flushed: 4,
            free_head: 0,
        };
        assert_eq!(
            record.validate(10),
            Err(MasterError::RootOutOfRange { root: 5, flushed: 4 })
        );

        let record = MasterRecord {
            root: 0,
            flushed: 11,
            free_head: 0,
        };
        assert!(matches!(
            record.validate(10),
            Err(MasterError::FlushedOutOfRange { .. })
        ));

        let record = MasterRecord {
            root: 0,
            flushed: 0,
            free_head: 0,
        };
        assert!(record.validate(10).is_err());

        let record = MasterRecord {
            root: 1,
            flushed: 3,
            free_head: 3,
        };
        assert!(matches!(
            record.validate(3),
            Err(MasterError::FreeHeadOutOfRange { head: 3, .. })
        ));
        MasterRecord::empty().validate(1).expect("empty record is valid");
    }

    #[test]
    fn test_truncated_record() {
        assert!(matches!(
            MasterRecord::decode(&SIGNATURE),
            Err(MasterError::Codec(_))
        ));
    }
}
