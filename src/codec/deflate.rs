use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::CodecError;

use super::{BlockCodec, CodecKind, CodecShape, CompressedBuffer};

/// zlib-wrapped deflate, backed by `flate2`.
#[derive(Debug, Clone)]
pub struct DeflateCodec {
    shape: CodecShape,
    level: Compression,
}

impl DeflateCodec {
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            shape: CodecShape::new(width, height, bits_per_pixel),
            level: Compression::default(),
        }
    }

    /// Use a specific compression level (0-9).
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl BlockCodec for DeflateCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Deflate
    }

    fn reset(&mut self) {
        self.shape.reset();
    }

    fn set_dimensions(&mut self, width: u32, height: u32) {
        self.shape.set_dimensions(width, height);
    }

    fn set_subset(&mut self, width: u32, height: u32) {
        self.shape.set_subset(width, height);
    }

    fn set_bits_per_pixel(&mut self, bits_per_pixel: u8) {
        self.shape.set_bits_per_pixel(bits_per_pixel);
    }

    fn compress(&mut self, src: &[u8]) -> Result<CompressedBuffer<'static>, CodecError> {
        self.shape.ensure_ready()?;
        let len = self.shape.check_input(src)?;

        let deflate_failed = |e: std::io::Error| CodecError::InvalidInput(format!("deflate failed: {e}"));

        let mut encoder = ZlibEncoder::new(Vec::with_capacity(len / 2 + 16), self.level);
        encoder.write_all(&src[..len]).map_err(deflate_failed)?;
        let out = encoder.finish().map_err(deflate_failed)?;
        Ok(CompressedBuffer::owned(CodecKind::Deflate, out, len))
    }

    fn decompress(
        &mut self,
        src: &CompressedBuffer<'_>,
        dst: &mut [u8],
    ) -> Result<usize, CodecError> {
        self.shape.ensure_ready()?;
        let len = self.shape.check_output(dst)?;

        // One byte past the expected size is enough to detect an oversized stream
        let mut decoder = ZlibDecoder::new(src.as_bytes()).take(len as u64 + 1);
        let mut out = Vec::with_capacity(len + 1);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CodecError::CorruptData(format!("inflate failed: {e}")))?;

        if out.len() > len {
            return Err(CodecError::CorruptData(format!(
                "inflated more than {len} bytes, expected {len}"
            )));
        }
        if out.len() != len {
            return Err(CodecError::CorruptData(format!(
                "inflated {} bytes, expected {len}",
                out.len()
            )));
        }
        dst[..len].copy_from_slice(&out);
        Ok(len)
    }
}
