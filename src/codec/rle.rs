//! PackBits run-length codec.
//!
//! Each row is encoded independently so a corrupt row cannot bleed into the
//! next. A control byte `n` in `0..=127` is followed by `n + 1` literal
//! bytes; `n` in `-127..=-1` (as i8) repeats the following byte `1 - n`
//! times; `-128` is a no-op.

use crate::error::CodecError;

use super::{BlockCodec, CodecKind, CodecShape, CompressedBuffer};

/// Longest run or literal sequence one control byte can describe.
const MAX_RUN: usize = 128;

/// Run-length codec operating on packed rows of any bit depth.
#[derive(Debug, Clone)]
pub struct RunLengthCodec {
    shape: CodecShape,
}

impl RunLengthCodec {
    pub fn new(width: u32, height: u32, bits_per_pixel: u8) -> Self {
        Self {
            shape: CodecShape::new(width, height, bits_per_pixel),
        }
    }
}

/// Append the PackBits encoding of `row` to `out`.
fn encode_row(row: &[u8], out: &mut Vec<u8>) {
    let mut i = 0;
    while i < row.len() {
        // Measure the run starting at i
        let mut run = 1;
        while i + run < row.len() && run < MAX_RUN && row[i + run] == row[i] {
            run += 1;
        }

        if run >= 2 {
            out.push((1i16 - run as i16) as i8 as u8);
            out.push(row[i]);
            i += run;
            continue;
        }

        // Collect literals until a run of at least two starts
        let start = i;
        while i < row.len() && i - start < MAX_RUN {
            if i + 1 < row.len() && row[i] == row[i + 1] {
                break;
            }
            i += 1;
        }
        out.push((i - start - 1) as u8);
        out.extend_from_slice(&row[start..i]);
    }
}

/// Decode one row of `row.len()` bytes from `src` starting at `pos`.
fn decode_row(src: &[u8], mut pos: usize, row: &mut [u8]) -> Result<usize, CodecError> {
    let mut filled = 0;
    while filled < row.len() {
        let control = *src
            .get(pos)
            .ok_or_else(|| CodecError::CorruptData("run-length stream ended mid-row".into()))?
            as i8;
        pos += 1;

        match control {
            -128 => {}
            0..=127 => {
                let count = control as usize + 1;
                let literal = src.get(pos..pos + count).ok_or_else(|| {
                    CodecError::CorruptData("literal run past end of stream".into())
                })?;
                let target = row.get_mut(filled..filled + count).ok_or_else(|| {
                    CodecError::CorruptData("literal run overruns row".into())
                })?;
                target.copy_from_slice(literal);
                pos += count;
                filled += count;
            }
            _ => {
                let count = (1 - control as i16) as usize;
                let value = *src.get(pos).ok_or_else(|| {
                    CodecError::CorruptData("repeat run past end of stream".into())
                })?;
                let target = row.get_mut(filled..filled + count).ok_or_else(|| {
                    CodecError::CorruptData("repeat run overruns row".into())
                })?;
                target.fill(value);
                pos += 1;
                filled += count;
            }
        }
    }
    Ok(pos)
}

impl BlockCodec for RunLengthCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::RunLength
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
        let row_bytes = self.shape.row_bytes();

        let mut out = Vec::with_capacity(len / 2 + 16);
        if row_bytes > 0 {
            for row in src[..len].chunks(row_bytes) {
                encode_row(row, &mut out);
            }
        }
        Ok(CompressedBuffer::owned(CodecKind::RunLength, out, len))
    }

    fn decompress(
        &mut self,
        src: &CompressedBuffer<'_>,
        dst: &mut [u8],
    ) -> Result<usize, CodecError> {
        self.shape.ensure_ready()?;
        let len = self.shape.check_output(dst)?;
        let row_bytes = self.shape.row_bytes();
        let bytes = src.as_bytes();

        let mut pos = 0;
        if row_bytes > 0 {
            for row in dst[..len].chunks_mut(row_bytes) {
                pos = decode_row(bytes, pos, row)?;
            }
        }
        if pos != bytes.len() {
            return Err(CodecError::CorruptData(format!(
                "{} trailing bytes after last row",
                bytes.len() - pos
            )));
        }
        Ok(len)
    }
}
