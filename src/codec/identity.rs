use crate::error::CodecError;

use super::{BlockCodec, CodecKind, CodecShape, CompressedBuffer};

/// Stores blocks as-is.
#[derive(Debug, Clone)]
pub struct IdentityCodec {
    shape: CodecShape,
}

impl IdentityCodec {
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            shape: CodecShape::new(width, height, bits_per_pixel),
        }
    }
}

impl BlockCodec for IdentityCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Identity
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
        Ok(CompressedBuffer::owned(
            CodecKind::Identity,
            src[..len].to_vec(),
            len,
        ))
    }

    fn decompress(
        &mut self,
        src: &CompressedBuffer<'_>,
        dst: &mut [u8],
    ) -> Result<usize, CodecError> {
        self.shape.ensure_ready()?;
        let len = self.shape.check_output(dst)?;
        if src.physical_len() != len {
            return Err(CodecError::CorruptData(format!(
                "uncompressed block is {} bytes, expected {}",
                src.physical_len(),
                len
            )));
        }
        dst[..len].copy_from_slice(src.as_bytes());
        Ok(len)
    }
}
