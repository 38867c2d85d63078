//! CCITT Group 4 (T.6, "MMR") codec for bilevel blocks.
//!
//! Pixels are packed MSB first, a clear bit is white and a set bit is black.
//! Each coded line is described relative to the line above it (the
//! reference line); the first line of an image is coded against an imaginary
//! all-white line. The codec keeps the last coded line as its reference
//! between calls, so consecutive strips of one image chain together unless
//! [`BlockCodec::reset`] is called in between. Each block ends with an EOFB
//! (two EOL codes) and is padded to a byte boundary.

use crate::error::CodecError;

use super::{BlockCodec, CodecKind, CodecShape, CompressedBuffer};

/// A run-length code: `(code bits, bit length, run length)`.
type RunCode = (u16, u8, u32);

const EOL: (u16, u8) = (0b0000_0000_0001, 12);
const PASS: (u16, u8) = (0b0001, 4);
const HORIZONTAL: (u16, u8) = (0b001, 3);

/// Vertical mode codes indexed by `a1 - b1 + 3`.
const VERTICAL: [(u16, u8); 7] = [
    (0b0000010, 7),
    (0b000010, 6),
    (0b010, 3),
    (0b1, 1),
    (0b011, 3),
    (0b000011, 6),
    (0b0000011, 7),
];

#[rustfmt::skip]
const WHITE_CODES: [RunCode; 91] = [
    (0b00110101, 8, 0), (0b000111, 6, 1), (0b0111, 4, 2), (0b1000, 4, 3),
    (0b1011, 4, 4), (0b1100, 4, 5), (0b1110, 4, 6), (0b1111, 4, 7),
    (0b10011, 5, 8), (0b10100, 5, 9), (0b00111, 5, 10), (0b01000, 5, 11),
    (0b001000, 6, 12), (0b000011, 6, 13), (0b110100, 6, 14), (0b110101, 6, 15),
    (0b101010, 6, 16), (0b101011, 6, 17), (0b0100111, 7, 18), (0b0001100, 7, 19),
    (0b0001000, 7, 20), (0b0010111, 7, 21), (0b0000011, 7, 22), (0b0000100, 7, 23),
    (0b0101000, 7, 24), (0b0101011, 7, 25), (0b0010011, 7, 26), (0b0100100, 7, 27),
    (0b0011000, 7, 28), (0b00000010, 8, 29), (0b00000011, 8, 30), (0b00011010, 8, 31),
    (0b00011011, 8, 32), (0b00010010, 8, 33), (0b00010011, 8, 34), (0b00010100, 8, 35),
    (0b00010101, 8, 36), (0b00010110, 8, 37), (0b00010111, 8, 38), (0b00101000, 8, 39),
    (0b00101001, 8, 40), (0b00101010, 8, 41), (0b00101011, 8, 42), (0b00101100, 8, 43),
    (0b00101101, 8, 44), (0b00000100, 8, 45), (0b00000101, 8, 46), (0b00001010, 8, 47),
    (0b00001011, 8, 48), (0b01010010, 8, 49), (0b01010011, 8, 50), (0b01010100, 8, 51),
    (0b01010101, 8, 52), (0b00100100, 8, 53), (0b00100101, 8, 54), (0b01011000, 8, 55),
    (0b01011001, 8, 56), (0b01011010, 8, 57), (0b01011011, 8, 58), (0b01001010, 8, 59),
    (0b01001011, 8, 60), (0b00110010, 8, 61), (0b00110011, 8, 62), (0b00110100, 8, 63),
    // Make-up codes
    (0b11011, 5, 64), (0b10010, 5, 128), (0b010111, 6, 192), (0b0110111, 7, 256),
    (0b00110110, 8, 320), (0b00110111, 8, 384), (0b01100100, 8, 448), (0b01100101, 8, 512),
    (0b01101000, 8, 576), (0b01100111, 8, 640), (0b011001100, 9, 704), (0b011001101, 9, 768),
    (0b011010010, 9, 832), (0b011010011, 9, 896), (0b011010100, 9, 960), (0b011010101, 9, 1024),
    (0b011010110, 9, 1088), (0b011010111, 9, 1152), (0b011011000, 9, 1216), (0b011011001, 9, 1280),
    (0b011011010, 9, 1344), (0b011011011, 9, 1408), (0b010011000, 9, 1472), (0b010011001, 9, 1536),
    (0b010011010, 9, 1600), (0b011000, 6, 1664), (0b010011011, 9, 1728),
];

#[rustfmt::skip]
const BLACK_CODES: [RunCode; 91] = [
    (0b0000110111, 10, 0), (0b010, 3, 1), (0b11, 2, 2), (0b10, 2, 3),
    (0b011, 3, 4), (0b0011, 4, 5), (0b0010, 4, 6), (0b00011, 5, 7),
    (0b000101, 6, 8), (0b000100, 6, 9), (0b0000100, 7, 10), (0b0000101, 7, 11),
    (0b0000111, 7, 12), (0b00000100, 8, 13), (0b00000111, 8, 14), (0b000011000, 9, 15),
    (0b0000010111, 10, 16), (0b0000011000, 10, 17), (0b0000001000, 10, 18), (0b00001100111, 11, 19),
    (0b00001101000, 11, 20), (0b00001101100, 11, 21), (0b00000110111, 11, 22), (0b00000101000, 11, 23),
    (0b00000010111, 11, 24), (0b00000011000, 11, 25), (0b000011001010, 12, 26), (0b000011001011, 12, 27),
    (0b000011001100, 12, 28), (0b000011001101, 12, 29), (0b000001101000, 12, 30), (0b000001101001, 12, 31),
    (0b000001101010, 12, 32), (0b000001101011, 12, 33), (0b000011010010, 12, 34), (0b000011010011, 12, 35),
    (0b000011010100, 12, 36), (0b000011010101, 12, 37), (0b000011010110, 12, 38), (0b000011010111, 12, 39),
    (0b000001101100, 12, 40), (0b000001101101, 12, 41), (0b000011011010, 12, 42), (0b000011011011, 12, 43),
    (0b000001010100, 12, 44), (0b000001010101, 12, 45), (0b000001010110, 12, 46), (0b000001010111, 12, 47),
    (0b000001100100, 12, 48), (0b000001100101, 12, 49), (0b000001010010, 12, 50), (0b000001010011, 12, 51),
    (0b000000100100, 12, 52), (0b000000110111, 12, 53), (0b000000111000, 12, 54), (0b000000100111, 12, 55),
    (0b000000101000, 12, 56), (0b000001011000, 12, 57), (0b000001011001, 12, 58), (0b000000101011, 12, 59),
    (0b000000101100, 12, 60), (0b000001011010, 12, 61), (0b000001100110, 12, 62), (0b000001100111, 12, 63),
    // Make-up codes
    (0b0000001111, 10, 64), (0b000011001000, 12, 128), (0b000011001001, 12, 192), (0b000001011011, 12, 256),
    (0b000000110011, 12, 320), (0b000000110100, 12, 384), (0b000000110101, 12, 448), (0b0000001101100, 13, 512),
    (0b0000001101101, 13, 576), (0b0000001001010, 13, 640), (0b0000001001011, 13, 704), (0b0000001001100, 13, 768),
    (0b0000001001101, 13, 832), (0b0000001110010, 13, 896), (0b0000001110011, 13, 960), (0b0000001110100, 13, 1024),
    (0b0000001110101, 13, 1088), (0b0000001110110, 13, 1152), (0b0000001110111, 13, 1216), (0b0000001010010, 13, 1280),
    (0b0000001010011, 13, 1344), (0b0000001010100, 13, 1408), (0b0000001010101, 13, 1472), (0b0000001011010, 13, 1536),
    (0b0000001011011, 13, 1600), (0b0000001100100, 13, 1664), (0b0000001100101, 13, 1728),
];

/// Make-up codes shared by both colors for runs of 1792 and more.
#[rustfmt::skip]
const EXTENDED_MAKEUP: [RunCode; 13] = [
    (0b00000001000, 11, 1792), (0b00000001100, 11, 1856), (0b00000001101, 11, 1920),
    (0b000000010010, 12, 1984), (0b000000010011, 12, 2048), (0b000000010100, 12, 2112),
    (0b000000010101, 12, 2176), (0b000000010110, 12, 2240), (0b000000010111, 12, 2304),
    (0b000000011100, 12, 2368), (0b000000011101, 12, 2432), (0b000000011110, 12, 2496),
    (0b000000011111, 12, 2560),
];

const MAX_MAKEUP: u32 = 2560;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Black,
}

impl Color {
    fn flip(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    fn codes(self) -> &'static [RunCode; 91] {
        match self {
            Color::White => &WHITE_CODES,
            Color::Black => &BLACK_CODES,
        }
    }
}

// =============================================================================
// Bit I/O
// =============================================================================

#[derive(Default)]
struct BitWriter {
    out: Vec<u8>,
    acc: u8,
    filled: u8,
}

impl BitWriter {
    fn put(&mut self, code: u16, len: u8) {
        for shift in (0..len).rev() {
            let bit = ((code >> shift) & 1) as u8;
            self.acc = (self.acc << 1) | bit;
            self.filled += 1;
            if self.filled == 8 {
                self.out.push(self.acc);
                self.acc = 0;
                self.filled = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.filled > 0 {
            self.out.push(self.acc << (8 - self.filled));
        }
        self.out
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bits_left(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Peek `len` bits MSB first, or `None` if the stream is shorter.
    fn peek(&self, len: u8) -> Option<u16> {
        if (len as usize) > self.bits_left() {
            return None;
        }
        let mut value = 0u16;
        for i in 0..len as usize {
            let bit_pos = self.pos + i;
            let bit = (self.data[bit_pos / 8] >> (7 - bit_pos % 8)) & 1;
            value = (value << 1) | bit as u16;
        }
        Some(value)
    }

    fn consume(&mut self, len: u8) {
        self.pos += len as usize;
    }

    fn matches(&mut self, (code, len): (u16, u8)) -> bool {
        if self.peek(len) == Some(code) {
            self.consume(len);
            true
        } else {
            false
        }
    }
}

fn corrupt(message: &str) -> CodecError {
    CodecError::CorruptData(format!("fax group 4: {message}"))
}

// =============================================================================
// Changing Elements
// =============================================================================

/// Positions where a row changes color, starting from an imaginary white pixel.
///
/// Even indices are white-to-black transitions, odd indices black-to-white.
fn changing_elements(row: &[u8], width: u32) -> Vec<u32> {
    let mut changes = Vec::new();
    let mut current = false;
    for x in 0..width {
        let black = (row[(x / 8) as usize] >> (7 - x % 8)) & 1 == 1;
        if black != current {
            changes.push(x);
            current = black;
        }
    }
    changes
}

/// Paint the black spans described by `changes` into a cleared row.
fn paint_row(changes: &[u32], width: u32, row: &mut [u8]) {
    row.fill(0);
    for span in changes.chunks(2) {
        let start = span[0];
        let end = span.get(1).copied().unwrap_or(width);
        for x in start..end {
            row[(x / 8) as usize] |= 0x80 >> (x % 8);
        }
    }
}

/// Locate b1 and b2 on the reference line for the current a0 and color.
fn find_b1_b2(reference: &[u32], a0: i64, color: Color, width: u32) -> (u32, u32) {
    // b1 must have the opposite color of a0: black transitions sit at even indices
    let wanted_parity = match color {
        Color::White => 0,
        Color::Black => 1,
    };
    let mut i = reference.partition_point(|&p| (p as i64) <= a0);
    if i % 2 != wanted_parity {
        i += 1;
    }
    let b1 = reference.get(i).copied().unwrap_or(width);
    let b2 = reference.get(i + 1).copied().unwrap_or(width);
    (b1, b2)
}

// =============================================================================
// Run Encoding
// =============================================================================

fn put_run(writer: &mut BitWriter, color: Color, mut run: u32) {
    let codes = color.codes();
    while run >= MAX_MAKEUP {
        let (code, len, _) = EXTENDED_MAKEUP[EXTENDED_MAKEUP.len() - 1];
        writer.put(code, len);
        run -= MAX_MAKEUP;
    }
    if run >= 64 {
        let makeup = run / 64 * 64;
        let (code, len, _) = if makeup <= 1728 {
            codes[63 + (makeup / 64) as usize]
        } else {
            EXTENDED_MAKEUP[((makeup - 1792) / 64) as usize]
        };
        writer.put(code, len);
        run -= makeup;
    }
    let (code, len, _) = codes[run as usize];
    writer.put(code, len);
}

fn read_code(reader: &mut BitReader<'_>, color: Color) -> Result<u32, CodecError> {
    let codes = color.codes();
    for len in 2..=13u8 {
        let Some(bits) = reader.peek(len) else {
            break;
        };
        let found = codes
            .iter()
            .chain(EXTENDED_MAKEUP.iter())
            .find(|&&(code, code_len, _)| code_len == len && code == bits);
        if let Some(&(_, _, run)) = found {
            reader.consume(len);
            return Ok(run);
        }
    }
    Err(corrupt("invalid run-length code"))
}

fn read_run(reader: &mut BitReader<'_>, color: Color) -> Result<u32, CodecError> {
    let mut total = 0u32;
    loop {
        let run = read_code(reader, color)?;
        total = total.saturating_add(run);
        if run < 64 {
            return Ok(total);
        }
    }
}

// =============================================================================
// Line Coding
// =============================================================================

fn encode_line(writer: &mut BitWriter, reference: &[u32], coding: &[u32], width: u32) {
    let mut a0: i64 = -1;
    let mut color = Color::White;

    while a0 < width as i64 {
        let next = coding.partition_point(|&p| (p as i64) <= a0);
        let a1 = coding.get(next).copied().unwrap_or(width);
        let (b1, b2) = find_b1_b2(reference, a0, color, width);

        if b2 < a1 {
            writer.put(PASS.0, PASS.1);
            a0 = b2 as i64;
            continue;
        }

        let delta = a1 as i64 - b1 as i64;
        if (-3..=3).contains(&delta) {
            let (code, len) = VERTICAL[(delta + 3) as usize];
            writer.put(code, len);
            a0 = a1 as i64;
            color = color.flip();
            continue;
        }

        let a2 = coding.get(next + 1).copied().unwrap_or(width);
        let start = a0.max(0) as u32;
        writer.put(HORIZONTAL.0, HORIZONTAL.1);
        put_run(writer, color, a1 - start);
        put_run(writer, color.flip(), a2 - a1);
        a0 = a2 as i64;
    }
}

/// Record a changing element, rejecting positions that do not advance.
fn push_change(coding: &mut Vec<u32>, position: u32, width: u32) -> Result<(), CodecError> {
    if position > width {
        return Err(corrupt("run extends past end of line"));
    }
    if let Some(&last) = coding.last() {
        if position <= last {
            return Err(corrupt("changing elements out of order"));
        }
    }
    if position < width {
        coding.push(position);
    }
    Ok(())
}

fn decode_line(
    reader: &mut BitReader<'_>,
    reference: &[u32],
    width: u32,
) -> Result<Vec<u32>, CodecError> {
    let mut coding = Vec::new();
    let mut a0: i64 = -1;
    let mut color = Color::White;

    while a0 < width as i64 {
        let (b1, b2) = find_b1_b2(reference, a0, color, width);

        if reader.matches(PASS) {
            a0 = b2 as i64;
            continue;
        }

        if reader.matches(HORIZONTAL) {
            let start = a0.max(0) as u32;
            let a1 = start.saturating_add(read_run(reader, color)?);
            let a2 = a1.saturating_add(read_run(reader, color.flip())?);
            push_change(&mut coding, a1, width)?;
            push_change(&mut coding, a2, width)?;
            a0 = a2 as i64;
            continue;
        }

        let vertical = VERTICAL
            .iter()
            .position(|&code| reader.peek(code.1) == Some(code.0));
        match vertical {
            Some(i) => {
                reader.consume(VERTICAL[i].1);
                let a1 = b1 as i64 + i as i64 - 3;
                if a1 < 0 || a1 <= a0 {
                    return Err(corrupt("vertical mode moves backwards"));
                }
                push_change(&mut coding, a1 as u32, width)?;
                a0 = a1;
                color = color.flip();
            }
            None if reader.peek(EOL.1) == Some(EOL.0) => {
                return Err(corrupt("end of block before last line"));
            }
            None => return Err(corrupt("invalid mode code")),
        }
    }

    Ok(coding)
}

// =============================================================================
// Codec
// =============================================================================

/// CCITT Group 4 codec. Requires 1 bit per pixel.
#[derive(Debug, Clone)]
pub struct FaxGroup4Codec {
    shape: CodecShape,
    /// Changing elements of the last line coded; empty means all white.
    reference: Vec<u32>,
}

impl FaxGroup4Codec {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            shape: CodecShape::new(width, height, 1),
            reference: Vec::new(),
        }
    }

    fn ensure_bilevel(&self) -> Result<(), CodecError> {
        self.shape.ensure_ready()?;
        if self.shape.bits_per_pixel != 1 {
            return Err(CodecError::InvalidInput(format!(
                "fax group 4 needs 1 bit per pixel, got {}",
                self.shape.bits_per_pixel
            )));
        }
        Ok(())
    }
}

impl BlockCodec for FaxGroup4Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::FaxGroup4
    }

    fn reset(&mut self) {
        self.shape.reset();
        self.reference.clear();
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
        self.ensure_bilevel()?;
        let len = self.shape.check_input(src)?;
        let width = self.shape.subset_width;
        let row_bytes = self.shape.row_bytes();

        let mut writer = BitWriter::default();
        for row in src[..len].chunks(row_bytes.max(1)) {
            let coding = changing_elements(row, width);
            encode_line(&mut writer, &self.reference, &coding, width);
            self.reference = coding;
        }
        writer.put(EOL.0, EOL.1);
        writer.put(EOL.0, EOL.1);

        Ok(CompressedBuffer::owned(
            CodecKind::FaxGroup4,
            writer.finish(),
            len,
        ))
    }

    fn decompress(
        &mut self,
        src: &CompressedBuffer<'_>,
        dst: &mut [u8],
    ) -> Result<usize, CodecError> {
        self.ensure_bilevel()?;
        let len = self.shape.check_output(dst)?;
        let width = self.shape.subset_width;
        let row_bytes = self.shape.row_bytes();

        let mut reader = BitReader::new(src.as_bytes());
        for row in dst[..len].chunks_mut(row_bytes.max(1)) {
            let coding = decode_line(&mut reader, &self.reference, width)?;
            paint_row(&coding, width, row);
            self.reference = coding;
        }

        if !(reader.matches(EOL) && reader.matches(EOL)) {
            return Err(corrupt("missing end-of-block marker"));
        }
        let consumed_bytes = reader.pos.div_ceil(8);
        if consumed_bytes != src.physical_len() {
            return Err(corrupt("trailing data after end-of-block marker"));
        }
        Ok(len)
    }
}
