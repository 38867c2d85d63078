//! Little-endian primitive encoding.
//!
//! Every on-disk structure (block directories, file headers, metadata
//! sidecars) is written with [`Encoder`] and read back with [`Decoder`].
//! Byte order is fixed to little-endian regardless of the host.

use crate::error::CodecError;

// =============================================================================
// Encoder
// =============================================================================

/// Writes primitives into a caller-owned, fixed-capacity buffer.
///
/// The encoder never writes past the end of its buffer. A write that does not
/// fit fails with [`CodecError::BufferOverflow`] and leaves the cursor where
/// it was, so nothing is partially written.
#[derive(Debug)]
pub struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    /// Create an encoder over `buf`; its length is the capacity.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.pos
    }

    /// Total capacity of the underlying buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Reserve `len` bytes at the cursor and return them for writing.
    fn claim(&mut self, len: usize) -> Result<&mut [u8], CodecError> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(CodecError::BufferOverflow {
                needed: end,
                capacity: self.buf.len(),
            });
        }
        let start = self.pos;
        self.pos = end;
        Ok(&mut self.buf[start..end])
    }

    pub fn put8(&mut self, value: u8) -> Result<(), CodecError> {
        self.claim(1)?[0] = value;
        Ok(())
    }

    pub fn put16(&mut self, value: u16) -> Result<(), CodecError> {
        self.claim(2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put32(&mut self, value: u32) -> Result<(), CodecError> {
        self.claim(4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn put64(&mut self, value: u64) -> Result<(), CodecError> {
        self.claim(8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy a raw byte range into the buffer.
    pub fn put_bytes(&mut self, src: &[u8]) -> Result<(), CodecError> {
        self.claim(src.len())?.copy_from_slice(src);
        Ok(())
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// Reads primitives from a byte slice.
///
/// The decoder does not bound-check reads beyond what slice indexing does.
/// Callers must hand it a buffer at least as large as the structure being
/// read, which is why file readers fetch an exact-length record before
/// decoding it. Use [`Decoder::remaining`] to validate variable-length data.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn size(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let start = self.pos;
        self.pos += len;
        &self.buf[start..self.pos]
    }

    /// # Panics
    /// Panics if no bytes remain.
    pub fn get8(&mut self) -> u8 {
        self.take(1)[0]
    }

    /// # Panics
    /// Panics if fewer than 2 bytes remain.
    pub fn get16(&mut self) -> u16 {
        read_u16_le(self.take(2))
    }

    /// # Panics
    /// Panics if fewer than 4 bytes remain.
    pub fn get32(&mut self) -> u32 {
        read_u32_le(self.take(4))
    }

    /// # Panics
    /// Panics if fewer than 8 bytes remain.
    pub fn get64(&mut self) -> u64 {
        read_u64_le(self.take(8))
    }

    /// Copy `dst.len()` bytes out of the buffer.
    ///
    /// # Panics
    /// Panics if fewer than `dst.len()` bytes remain.
    pub fn copy_bytes(&mut self, dst: &mut [u8]) {
        dst.copy_from_slice(self.take(dst.len()));
    }

    /// Borrow the next `len` bytes without copying.
    ///
    /// # Panics
    /// Panics if fewer than `len` bytes remain.
    pub fn get_slice(&mut self, len: usize) -> &'a [u8] {
        self.take(len)
    }
}

// =============================================================================
// Slice Helpers
// =============================================================================

/// Read a little-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a little-endian u64 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 8 bytes.
#[inline]
pub fn read_u64_le(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
