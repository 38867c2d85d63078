//! Compressed buffer descriptor.
//!
//! A [`CompressedBuffer`] pairs the bytes of one compressed block with the
//! codec that produced them and the block's logical (uncompressed) size.
//! Whether the bytes are owned by the packet or borrowed from the caller is
//! part of the type, never inferred.

use bytes::Bytes;

use super::CodecKind;

/// Backing storage of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData<'a> {
    /// Allocated and freed by the engine
    Owned(Vec<u8>),

    /// Supplied by the caller; the packet never frees it
    Borrowed(&'a [u8]),
}

/// One compressed block and how to decompress it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedBuffer<'a> {
    data: PacketData<'a>,
    logical_len: usize,
    codec: CodecKind,
}

impl CompressedBuffer<'static> {
    /// Wrap bytes the engine allocated.
    pub fn owned(codec: CodecKind, data: Vec<u8>, logical_len: usize) -> Self {
        Self {
            data: PacketData::Owned(data),
            logical_len,
            codec,
        }
    }
}

impl<'a> CompressedBuffer<'a> {
    /// Wrap caller-owned bytes without copying them.
    pub fn borrowed(codec: CodecKind, data: &'a [u8], logical_len: usize) -> Self {
        Self {
            data: PacketData::Borrowed(data),
            logical_len,
            codec,
        }
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Size of the data once decompressed.
    pub fn logical_len(&self) -> usize {
        self.logical_len
    }

    /// Size of the compressed bytes.
    pub fn physical_len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            PacketData::Owned(data) => data,
            PacketData::Borrowed(data) => data,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.data, PacketData::Owned(_))
    }

    pub fn data(&self) -> &PacketData<'a> {
        &self.data
    }

    /// Detach from any borrowed storage, copying if needed.
    pub fn into_owned(self) -> CompressedBuffer<'static> {
        let data = match self.data {
            PacketData::Owned(data) => data,
            PacketData::Borrowed(data) => data.to_vec(),
        };
        CompressedBuffer::owned(self.codec, data, self.logical_len)
    }

    /// Convert to a shareable [`Bytes`]; owned storage is moved, not copied.
    pub fn into_bytes(self) -> Bytes {
        match self.data {
            PacketData::Owned(data) => Bytes::from(data),
            PacketData::Borrowed(data) => Bytes::copy_from_slice(data),
        }
    }
}
