//! Metadata container list.
//!
//! An image carries an ordered set of sidecar records keyed by a 16-bit
//! type tag. A list holds at most one record per tag; setting a record with
//! a tag already present replaces the old one in place.
//!
//! # Sidecar Encoding
//!
//! ```text
//! count: u32
//! repeated count times:
//!     tag: u16, length: u32, payload: [u8; length]
//! ```
//!
//! All integers are little-endian. Decoding produces [`RawMetadata`]
//! records; typed records such as [`TextMetadata`] are recovered from them
//! with `from_raw`.

use std::any::Any;
use std::fmt;

use crate::error::CodecError;
use crate::io::{Decoder, Encoder};

/// Tag for a free-form image description.
pub const TAG_DESCRIPTION: u16 = 1;

/// Tag for the name of the software that wrote the image.
pub const TAG_SOFTWARE: u16 = 2;

/// Tag for a creation timestamp, stored as text.
pub const TAG_DATE_TIME: u16 = 3;

const RECORD_HEADER_LEN: usize = 6;

// =============================================================================
// Metadata Record Trait
// =============================================================================

/// One typed metadata record.
///
/// Each implementation supplies its own deep copy through `clone_record`,
/// which is what makes [`MetadataContainerList`] cloneable.
pub trait MetadataRecord: fmt::Debug + Send + Sync {
    fn tag(&self) -> u16;

    fn is_dirty(&self) -> bool;

    fn set_dirty(&mut self, dirty: bool);

    /// Encoded payload as written to the sidecar.
    fn payload(&self) -> Vec<u8>;

    fn clone_record(&self) -> Box<dyn MetadataRecord>;

    fn as_any(&self) -> &dyn Any;
}

/// Opaque payload under an arbitrary tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMetadata {
    tag: u16,
    data: Vec<u8>,
    dirty: bool,
}

impl RawMetadata {
    /// A new record, marked dirty.
    pub fn new(tag: u16, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
            dirty: true,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl MetadataRecord for RawMetadata {
    fn tag(&self) -> u16 {
        self.tag
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn payload(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn clone_record(&self) -> Box<dyn MetadataRecord> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// UTF-8 text under a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMetadata {
    tag: u16,
    text: String,
    dirty: bool,
}

impl TextMetadata {
    /// A new record, marked dirty.
    pub fn new(tag: u16, text: impl Into<String>) -> Self {
        Self {
            tag,
            text: text.into(),
            dirty: true,
        }
    }

    /// Interpret a decoded raw record as text.
    pub fn from_raw(raw: &RawMetadata) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(raw.data()).map_err(|e| {
            CodecError::CorruptData(format!("metadata tag {} is not UTF-8: {e}", raw.tag()))
        })?;
        Ok(Self {
            tag: raw.tag(),
            text: text.to_string(),
            dirty: raw.is_dirty(),
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl MetadataRecord for TextMetadata {
    fn tag(&self) -> u16 {
        self.tag
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn payload(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    fn clone_record(&self) -> Box<dyn MetadataRecord> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Container List
// =============================================================================

/// Ordered, tag-keyed collection of metadata records.
///
/// Iteration follows insertion order; replacing a record keeps its position.
#[derive(Debug, Default)]
pub struct MetadataContainerList {
    records: Vec<Box<dyn MetadataRecord>>,
}

impl MetadataContainerList {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, tag: u16) -> Option<usize> {
        self.records.iter().position(|r| r.tag() == tag)
    }

    /// Insert a record, replacing any record with the same tag.
    ///
    /// Returns the replaced record.
    pub fn set<R: MetadataRecord + 'static>(
        &mut self,
        record: R,
    ) -> Option<Box<dyn MetadataRecord>> {
        self.set_boxed(Box::new(record))
    }

    pub fn set_boxed(
        &mut self,
        record: Box<dyn MetadataRecord>,
    ) -> Option<Box<dyn MetadataRecord>> {
        match self.position(record.tag()) {
            Some(i) => Some(std::mem::replace(&mut self.records[i], record)),
            None => {
                self.records.push(record);
                None
            }
        }
    }

    pub fn get(&self, tag: u16) -> Option<&dyn MetadataRecord> {
        self.records
            .iter()
            .find(|r| r.tag() == tag)
            .map(|r| r.as_ref())
    }

    /// Get a record as a concrete type; `None` if absent or of another type.
    pub fn get_as<T: MetadataRecord + 'static>(&self, tag: u16) -> Option<&T> {
        self.get(tag)?.as_any().downcast_ref::<T>()
    }

    pub fn remove(&mut self, tag: u16) -> Option<Box<dyn MetadataRecord>> {
        let i = self.position(tag)?;
        Some(self.records.remove(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn MetadataRecord> {
        self.records.iter().map(|r| r.as_ref())
    }

    pub fn tags(&self) -> Vec<u16> {
        self.records.iter().map(|r| r.tag()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Set or clear the dirty flag of every record.
    pub fn set_all_dirty(&mut self, dirty: bool) {
        for record in &mut self.records {
            record.set_dirty(dirty);
        }
    }

    /// True if any record is dirty.
    pub fn is_dirty(&self) -> bool {
        self.records.iter().any(|r| r.is_dirty())
    }

    /// Encode every record in list order.
    pub fn encode_sidecar(&self) -> Result<Vec<u8>, CodecError> {
        let payloads: Vec<(u16, Vec<u8>)> =
            self.records.iter().map(|r| (r.tag(), r.payload())).collect();

        let size = 4 + payloads
            .iter()
            .map(|(_, p)| RECORD_HEADER_LEN + p.len())
            .sum::<usize>();
        let mut buf = vec![0u8; size];
        let mut encoder = Encoder::new(&mut buf);

        encoder.put32(to_u32(payloads.len(), "record count")?)?;
        for (tag, payload) in &payloads {
            encoder.put16(*tag)?;
            encoder.put32(to_u32(payload.len(), "record length")?)?;
            encoder.put_bytes(payload)?;
        }
        Ok(buf)
    }

    /// Decode a sidecar into clean [`RawMetadata`] records.
    pub fn decode_sidecar(bytes: &[u8]) -> Result<Self, CodecError> {
        let truncated = || CodecError::CorruptData("metadata sidecar truncated".to_string());

        if bytes.len() < 4 {
            return Err(truncated());
        }
        let mut decoder = Decoder::new(bytes);
        let count = decoder.get32();

        let mut list = Self::new();
        for _ in 0..count {
            if decoder.remaining() < RECORD_HEADER_LEN {
                return Err(truncated());
            }
            let tag = decoder.get16();
            let len = decoder.get32() as usize;
            if decoder.remaining() < len {
                return Err(truncated());
            }
            let mut record = RawMetadata::new(tag, decoder.get_slice(len));
            record.set_dirty(false);
            if list.set(record).is_some() {
                return Err(CodecError::CorruptData(format!(
                    "metadata tag {tag} appears twice"
                )));
            }
        }

        if decoder.remaining() != 0 {
            return Err(CodecError::CorruptData(format!(
                "{} trailing bytes after metadata sidecar",
                decoder.remaining()
            )));
        }
        Ok(list)
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32, CodecError> {
    u32::try_from(value).map_err(|_| CodecError::InvalidInput(format!("{what} too large: {value}")))
}

impl Clone for MetadataContainerList {
    fn clone(&self) -> Self {
        Self {
            records: self.records.iter().map(|r| r.clone_record()).collect(),
        }
    }
}
