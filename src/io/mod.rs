mod binary;

pub use binary::{read_u16_le, read_u32_le, read_u64_le, Decoder, Encoder};
