//! Block codecs.
//!
//! Every block of a resolution level is compressed by exactly one codec. The
//! engine only ever talks to the [`BlockCodec`] trait; concrete codecs are
//! created through a [`CodecRegistry`].
//!
//! # Components
//!
//! - [`IdentityCodec`]: stores blocks uncompressed
//! - [`RunLengthCodec`]: PackBits, row by row
//! - [`FaxGroup4Codec`]: CCITT T.6 for bilevel images
//! - [`DeflateCodec`]: zlib via `flate2`
//! - [`CompressedBuffer`]: one compressed block plus its codec and sizes
//!
//! Third-party codecs implement [`BlockCodec`] and register under
//! [`CodecKind::Vendor`].

mod deflate;
mod fax4;
mod identity;
mod packet;
mod registry;
mod rle;

pub use deflate::DeflateCodec;
pub use fax4::FaxGroup4Codec;
pub use identity::IdentityCodec;
pub use packet::{CompressedBuffer, PacketData};
pub use registry::{CodecFactory, CodecRegistry};
pub use rle::RunLengthCodec;

use crate::error::CodecError;
use crate::geometry::row_bytes;

/// First wire identifier available to vendor codecs.
pub const VENDOR_CODEC_BASE: u16 = 0x8000;

// =============================================================================
// Codec Kind
// =============================================================================

/// Identifies a compression scheme in files and packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Identity,
    RunLength,
    FaxGroup4,
    Deflate,
    /// Opaque third-party codec, numbered from [`VENDOR_CODEC_BASE`]
    Vendor(u16),
}

impl CodecKind {
    /// Stable identifier written to block files.
    pub fn id(self) -> u16 {
        match self {
            CodecKind::Identity => 0,
            CodecKind::RunLength => 1,
            CodecKind::FaxGroup4 => 2,
            CodecKind::Deflate => 3,
            CodecKind::Vendor(id) => id,
        }
    }

    pub fn from_id(id: u16) -> Result<Self, CodecError> {
        match id {
            0 => Ok(CodecKind::Identity),
            1 => Ok(CodecKind::RunLength),
            2 => Ok(CodecKind::FaxGroup4),
            3 => Ok(CodecKind::Deflate),
            id if id >= VENDOR_CODEC_BASE => Ok(CodecKind::Vendor(id)),
            id => Err(CodecError::UnknownCodec(id)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecKind::Identity => "identity",
            CodecKind::RunLength => "run-length",
            CodecKind::FaxGroup4 => "fax-group4",
            CodecKind::Deflate => "deflate",
            CodecKind::Vendor(_) => "vendor",
        }
    }
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecKind::Vendor(id) => write!(f, "vendor-{id:#06x}"),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// BlockCodec Trait
// =============================================================================

/// Compressor/decompressor for one block's pixel payload.
///
/// Geometry (`set_dimensions`/`set_subset`) is configured separately from
/// `reset`: geometry is usually stable for a whole level, while carried
/// coding state must be cleared whenever the next block does not directly
/// follow the previous one in scan order.
pub trait BlockCodec: Send {
    fn kind(&self) -> CodecKind;

    /// Clear any state carried from the previous block.
    fn reset(&mut self);

    /// Set the block dimensions. Also resets the subset to the full block.
    fn set_dimensions(&mut self, width: u32, height: u32);

    /// Restrict the next compress/decompress call to `width x height` pixels.
    fn set_subset(&mut self, width: u32, height: u32);

    /// Change the bit depth. The codec must be `reset()` before further use.
    fn set_bits_per_pixel(&mut self, bits_per_pixel: u8);

    /// Compress one block of raw pixel rows.
    fn compress(&mut self, src: &[u8]) -> Result<CompressedBuffer<'static>, CodecError>;

    /// Decompress `src` into `dst`, returning the number of bytes written.
    fn decompress(&mut self, src: &CompressedBuffer<'_>, dst: &mut [u8])
        -> Result<usize, CodecError>;
}

// =============================================================================
// Shared Geometry State
// =============================================================================

/// Geometry bookkeeping shared by the built-in codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CodecShape {
    pub width: u32,
    pub height: u32,
    pub subset_width: u32,
    pub subset_height: u32,
    pub bits_per_pixel: u8,
    pub needs_reset: bool,
}

impl CodecShape {
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            width,
            height,
            subset_width: width,
            subset_height: height,
            bits_per_pixel,
            needs_reset: false,
        }
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.subset_width = width;
        self.subset_height = height;
    }

    pub fn set_subset(&mut self, width: u32, height: u32) {
        self.subset_width = width;
        self.subset_height = height;
    }

    pub fn set_bits_per_pixel(&mut self, bits_per_pixel: u8) {
        if bits_per_pixel != self.bits_per_pixel {
            self.bits_per_pixel = bits_per_pixel;
            self.needs_reset = true;
        }
    }

    pub fn reset(&mut self) {
        self.needs_reset = false;
    }

    pub fn ensure_ready(&self) -> Result<(), CodecError> {
        if self.needs_reset {
            Err(CodecError::ResetRequired)
        } else {
            Ok(())
        }
    }

    pub fn row_bytes(&self) -> usize {
        row_bytes(self.subset_width, self.bits_per_pixel)
    }

    /// Raw byte length of the current subset.
    pub fn raw_len(&self) -> usize {
        self.row_bytes() * self.subset_height as usize
    }

    /// Check a raw input buffer is large enough and return the used prefix length.
    pub fn check_input(&self, src: &[u8]) -> Result<usize, CodecError> {
        let len = self.raw_len();
        if src.len() < len {
            return Err(CodecError::InvalidInput(format!(
                "need {} bytes for {}x{} at {} bpp, got {}",
                len,
                self.subset_width,
                self.subset_height,
                self.bits_per_pixel,
                src.len()
            )));
        }
        Ok(len)
    }

    /// Check an output buffer can hold the current subset.
    pub fn check_output(&self, dst: &[u8]) -> Result<usize, CodecError> {
        let len = self.raw_len();
        if dst.len() < len {
            return Err(CodecError::BufferOverflow {
                needed: len,
                capacity: dst.len(),
            });
        }
        Ok(len)
    }
}
