//! Little-endian field access over raw page buffers.
//!
//! All reads and writes are bounds-checked. A field that falls outside the
//! buffer produces a `CodecError` describing the range instead of a panic,
//! so corrupt pages surface as errors.

/// A field access that does not fit in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecError {
    /// Start of the requested range.
    pub offset: usize,
    /// Length of the requested range.
    pub len: usize,
    /// Length of the buffer that was accessed.
    pub buf_len: usize,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "range {}..{} out of bounds for buffer of {} bytes",
            self.offset,
            self.offset.saturating_add(self.len),
            self.buf_len
        )
    }
}

impl std::error::Error for CodecError {}

const fn out_of_bounds(offset: usize, len: usize, buf_len: usize) -> CodecError {
    CodecError {
        offset,
        len,
        buf_len,
    }
}

/// Borrow `len` bytes starting at `offset`.
pub fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| out_of_bounds(offset, len, buf.len()))
}

/// Mutably borrow `len` bytes starting at `offset`.
pub fn slice_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], CodecError> {
    let buf_len = buf.len();
    offset
        .checked_add(len)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or_else(|| out_of_bounds(offset, len, buf_len))
}

pub fn read_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(slice(buf, offset, 2)?);
    Ok(u16::from_le_bytes(bytes))
}

pub fn read_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(slice(buf, offset, 4)?);
    Ok(u32::from_le_bytes(bytes))
}

pub fn read_u64(buf: &[u8], offset: usize) -> Result<u64, CodecError> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(slice(buf, offset, 8)?);
    Ok(u64::from_le_bytes(bytes))
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), CodecError> {
    slice_mut(buf, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), CodecError> {
    slice_mut(buf, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<(), CodecError> {
    slice_mut(buf, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), CodecError> {
    slice_mut(buf, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_fields() {
        let mut buf = vec![0u8; 16];
        write_u16(&mut buf, 0, 0xBEEF).expect("write u16");
        write_u32(&mut buf, 2, 0xDEAD_BEEF).expect("write u32");
        write_u64(&mut buf, 6, u64::MAX - 1).expect("write u64");

        assert_eq!(read_u16(&buf, 0).expect("read u16"), 0xBEEF);
        assert_eq!(read_u32(&buf, 2).expect("read u32"), 0xDEAD_BEEF);
        assert_eq!(read_u64(&buf, 6).expect("read u64"), u64::MAX - 1);
        // little-endian on disk
        assert_eq!(&buf[0..2], &[0xEF, 0xBE]);
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let mut buf = vec![0u8; 8];
        let err = read_u64(&buf, 1).expect_err("read past end");
        assert_eq!(
            err,
            CodecError {
                offset: 1,
                len: 8,
                buf_len: 8
            }
        );
        assert!(write_bytes(&mut buf, 6, b"abc").is_err());
        assert!(slice(&buf, usize::MAX, 2).is_err());
        // nothing was written by the failed call
        assert_eq!(buf, vec![0u8; 8]);
    }
}
