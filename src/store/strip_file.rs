//! Append-only strip file.
//!
//! ```text
//! header (22 bytes):
//!   magic "RSTR" | version u16 | width u32 | height u32
//!   rows per strip u32 | bpp u8 | reserved u8 | codec u16
//! records, one per strip in order:
//!   physical u32 | logical u32 | payload [u8; physical]
//! ```
//!
//! Strips are numbered implicitly by their position, so the file only
//! accepts them in order. Opening scans the records to rebuild the index.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::codec::{CodecKind, CompressedBuffer};
use crate::error::{CodecError, StorageError};
use crate::geometry::{BlockGeometry, BlockLayout};
use crate::io::{read_u32_le, Decoder, Encoder};

use super::{BlockStore, FORMAT_VERSION, STRIP_FILE_MAGIC};

const HEADER_LEN: usize = 22;
const RECORD_HEADER_LEN: usize = 8;

fn corrupt(msg: impl Into<String>) -> StorageError {
    CodecError::CorruptData(msg.into()).into()
}

#[derive(Debug, Clone, Copy)]
struct Record {
    /// Offset of the payload, past the record header
    offset: u64,
    physical: u32,
    logical: u32,
}

/// A single-level image stored as a sequence of strips.
#[derive(Debug)]
pub struct StripFile {
    file: File,
    path: PathBuf,
    geometry: BlockGeometry,
    codec: CodecKind,
    records: Vec<Record>,
    end: u64,
    writable: bool,
}

impl StripFile {
    /// Create (or truncate) a strip file. `geometry` must use the strip layout.
    pub fn create(
        path: impl AsRef<Path>,
        geometry: BlockGeometry,
        codec: CodecKind,
    ) -> Result<Self, StorageError> {
        if geometry.layout() != BlockLayout::Strip {
            return Err(StorageError::InvalidGeometry(
                "strip files need a strip layout".to_string(),
            ));
        }

        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = [0u8; HEADER_LEN];
        let mut encoder = Encoder::new(&mut header);
        encoder.put_bytes(&STRIP_FILE_MAGIC)?;
        encoder.put16(FORMAT_VERSION)?;
        encoder.put32(geometry.width())?;
        encoder.put32(geometry.height())?;
        encoder.put32(geometry.block_height())?;
        encoder.put8(geometry.bits_per_pixel())?;
        encoder.put8(0)?;
        encoder.put16(codec.id())?;
        file.write_all(&header)?;

        debug!(path = %path.display(), strips = geometry.block_count(), %codec, "created strip file");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            codec,
            records: Vec::new(),
            end: HEADER_LEN as u64,
            writable: true,
        })
    }

    /// Open an existing strip file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path.as_ref(), false)
    }

    /// Open an existing strip file to read it and append further strips.
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_LEN {
            return Err(corrupt("file shorter than its header"));
        }
        let mut decoder = Decoder::new(&bytes[..HEADER_LEN]);
        let mut magic = [0u8; 4];
        decoder.copy_bytes(&mut magic);
        if magic != STRIP_FILE_MAGIC {
            return Err(corrupt("not a strip file"));
        }
        let version = decoder.get16();
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }
        let width = decoder.get32();
        let height = decoder.get32();
        let rows_per_strip = decoder.get32();
        let bits_per_pixel = decoder.get8();
        let _reserved = decoder.get8();
        let codec = CodecKind::from_id(decoder.get16())?;

        let geometry = BlockGeometry::strips(width, height, rows_per_strip, bits_per_pixel)
            .map_err(|e| corrupt(e.to_string()))?;

        let records = scan_records(&bytes, geometry.block_count())?;
        debug!(path = %path.display(), strips = records.len(), writable, "opened strip file");

        Ok(Self {
            file,
            path: path.to_path_buf(),
            geometry,
            codec,
            records,
            end: bytes.len() as u64,
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of strips written so far.
    pub fn strip_count(&self) -> usize {
        self.records.len()
    }

    /// True once every strip of the image has been written.
    pub fn is_complete(&self) -> bool {
        self.records.len() as u64 == self.geometry.block_count()
    }
}

/// Walk the records after the header. A record cut short is corruption.
fn scan_records(bytes: &[u8], max_records: u64) -> Result<Vec<Record>, StorageError> {
    let mut records = Vec::new();
    let mut pos = HEADER_LEN;

    while pos < bytes.len() {
        if records.len() as u64 == max_records {
            return Err(corrupt(format!(
                "data after the last of {max_records} strips"
            )));
        }
        if bytes.len() - pos < RECORD_HEADER_LEN {
            return Err(corrupt(format!("strip {} header truncated", records.len())));
        }
        let physical = read_u32_le(&bytes[pos..]);
        let logical = read_u32_le(&bytes[pos + 4..]);
        pos += RECORD_HEADER_LEN;

        if bytes.len() - pos < physical as usize {
            return Err(corrupt(format!(
                "strip {} payload truncated: {} of {} bytes",
                records.len(),
                bytes.len() - pos,
                physical
            )));
        }
        records.push(Record {
            offset: pos as u64,
            physical,
            logical,
        });
        pos += physical as usize;
    }
    Ok(records)
}

impl BlockStore for StripFile {
    fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn codec(&self) -> CodecKind {
        self.codec
    }

    fn read_packet(&mut self, index: u64) -> Result<Option<CompressedBuffer<'static>>, StorageError> {
        let Some(record) = self.records.get(index as usize).copied() else {
            return Ok(None);
        };
        let mut data = vec![0u8; record.physical as usize];
        self.file.seek(SeekFrom::Start(record.offset))?;
        self.file.read_exact(&mut data)?;
        Ok(Some(CompressedBuffer::owned(
            self.codec,
            data,
            record.logical as usize,
        )))
    }

    fn write_packet(
        &mut self,
        index: u64,
        packet: &CompressedBuffer<'_>,
    ) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::AccessDenied("file opened read-only"));
        }
        let next = self.records.len() as u64;
        if index != next {
            return Err(StorageError::InvalidState(format!(
                "strip {index} written out of order, expected strip {next}"
            )));
        }
        if index >= self.geometry.block_count() {
            return Err(StorageError::InvalidState(format!(
                "image has only {} strips",
                self.geometry.block_count()
            )));
        }

        let physical = u32::try_from(packet.physical_len())
            .map_err(|_| CodecError::InvalidInput("packet larger than 4GiB".to_string()))?;
        let logical = u32::try_from(packet.logical_len())
            .map_err(|_| CodecError::InvalidInput("strip larger than 4GiB".to_string()))?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        let mut encoder = Encoder::new(&mut header);
        encoder.put32(physical)?;
        encoder.put32(logical)?;

        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(&header)?;
        self.file.write_all(packet.as_bytes())?;

        let offset = self.end + RECORD_HEADER_LEN as u64;
        self.records.push(Record {
            offset,
            physical,
            logical,
        });
        self.end = offset + physical as u64;
        Ok(())
    }

    fn next_write_index(&self) -> Option<u64> {
        Some(self.records.len() as u64)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if self.writable {
            self.file.flush()?;
            self.file.sync_data()?;
        }
        Ok(())
    }
}
