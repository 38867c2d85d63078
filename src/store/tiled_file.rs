//! Local seekable pyramid file.
//!
//! One file holds every level of one image:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ header (16 bytes)                            │
//! │   magic "RPYR" | version u16 | levels u16    │
//! │   trailer offset u64                         │
//! ├──────────────────────────────────────────────┤
//! │ block payloads, in write order               │
//! ├──────────────────────────────────────────────┤
//! │ trailer (rewritten on flush)                 │
//! │   per level:                                 │
//! │     width u32 | height u32                   │
//! │     block width u32 | block height u32       │
//! │     layout u8 | bpp u8 | codec u16           │
//! │     block count u64                          │
//! │     directory: offset u64 | physical u32     │
//! │                | logical u32  (per block)    │
//! │   metadata sidecar                           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A directory entry with zero physical length marks a block that was never
//! written. Overwriting a block reuses its slot when the new packet fits and
//! appends otherwise. The trailer named by the header is never overwritten:
//! payloads are appended past it, and a flush writes the new trailer into
//! free space before switching the header over. Until then the previous
//! trailer still describes a consistent file.
//!
//! Dropping the last handle flushes pending changes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::codec::{CodecKind, CodecRegistry, CompressedBuffer};
use crate::error::{CodecError, StorageError};
use crate::geometry::{BlockGeometry, BlockLayout, Pyramid};
use crate::io::{Decoder, Encoder};
use crate::metadata::MetadataContainerList;

use super::{
    AccessMode, BlockStore, ResolutionAccessor, FORMAT_VERSION, TILED_FILE_MAGIC,
};

const HEADER_LEN: usize = 16;
const LEVEL_RECORD_LEN: usize = 28;
const DIRECTORY_ENTRY_LEN: usize = 16;

fn corrupt(msg: impl Into<String>) -> StorageError {
    CodecError::CorruptData(msg.into()).into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DirectoryEntry {
    offset: u64,
    physical: u32,
    logical: u32,
}

impl DirectoryEntry {
    fn is_present(&self) -> bool {
        self.physical != 0
    }
}

#[derive(Debug)]
struct Level {
    geometry: BlockGeometry,
    codec: CodecKind,
    directory: Vec<DirectoryEntry>,
}

/// Per-level description returned by [`TiledFile::summaries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSummary {
    pub level: usize,
    pub geometry: BlockGeometry,
    pub codec: CodecKind,
    /// Blocks holding data
    pub present: u64,
}

// =============================================================================
// File State
// =============================================================================

#[derive(Debug)]
struct Inner {
    file: File,
    path: PathBuf,
    writable: bool,
    levels: Vec<Level>,
    metadata: MetadataContainerList,
    /// End of the payload area
    end: u64,
    /// Trailer the header currently points at
    trailer_offset: u64,
    trailer_len: u64,
    dirty: bool,
}

impl Inner {
    /// Where the next appended payload goes, clear of the committed trailer.
    fn append_offset(&self) -> u64 {
        self.end.max(self.trailer_offset + self.trailer_len)
    }

    fn level(&self, level: usize) -> Result<&Level, StorageError> {
        self.levels
            .get(level)
            .ok_or_else(|| StorageError::InvalidState(format!("no level {level}")))
    }

    fn read_packet(
        &mut self,
        level: usize,
        index: u64,
    ) -> Result<Option<CompressedBuffer<'static>>, StorageError> {
        let (entry, codec) = {
            let level = self.level(level)?;
            match level.directory.get(index as usize) {
                Some(entry) if entry.is_present() => (*entry, level.codec),
                _ => return Ok(None),
            }
        };

        let mut data = vec![0u8; entry.physical as usize];
        self.file.seek(SeekFrom::Start(entry.offset))?;
        self.file.read_exact(&mut data)?;
        Ok(Some(CompressedBuffer::owned(
            codec,
            data,
            entry.logical as usize,
        )))
    }

    fn write_packet(
        &mut self,
        level: usize,
        index: u64,
        packet: &CompressedBuffer<'_>,
    ) -> Result<(), StorageError> {
        if !self.writable {
            return Err(StorageError::AccessDenied("file opened read-only"));
        }

        let physical = u32::try_from(packet.physical_len())
            .map_err(|_| CodecError::InvalidInput("packet larger than 4GiB".to_string()))?;
        let logical = u32::try_from(packet.logical_len())
            .map_err(|_| CodecError::InvalidInput("block larger than 4GiB".to_string()))?;
        if physical == 0 {
            return Err(CodecError::InvalidInput("empty packet".to_string()).into());
        }

        let current = {
            let stored = self.level(level)?;
            if packet.codec() != stored.codec {
                return Err(CodecError::InvalidInput(format!(
                    "level {level} stores {}, packet is {}",
                    stored.codec,
                    packet.codec()
                ))
                .into());
            }
            *stored.directory.get(index as usize).ok_or_else(|| {
                StorageError::InvalidState(format!("block {index} outside the level"))
            })?
        };

        let offset = if current.is_present() && physical <= current.physical {
            current.offset
        } else {
            let offset = self.append_offset();
            self.end = offset + physical as u64;
            offset
        };

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(packet.as_bytes())?;

        self.levels[level].directory[index as usize] = DirectoryEntry {
            offset,
            physical,
            logical,
        };
        self.dirty = true;
        Ok(())
    }

    fn encode_trailer(&self) -> Result<Vec<u8>, StorageError> {
        let sidecar = self.metadata.encode_sidecar()?;
        let size = self
            .levels
            .iter()
            .map(|l| LEVEL_RECORD_LEN + l.directory.len() * DIRECTORY_ENTRY_LEN)
            .sum::<usize>()
            + sidecar.len();

        let mut buf = vec![0u8; size];
        let mut encoder = Encoder::new(&mut buf);
        for level in &self.levels {
            let g = &level.geometry;
            encoder.put32(g.width())?;
            encoder.put32(g.height())?;
            encoder.put32(g.block_width())?;
            encoder.put32(g.block_height())?;
            encoder.put8(g.layout().to_u8())?;
            encoder.put8(g.bits_per_pixel())?;
            encoder.put16(level.codec.id())?;
            encoder.put64(level.directory.len() as u64)?;
            for entry in &level.directory {
                encoder.put64(entry.offset)?;
                encoder.put32(entry.physical)?;
                encoder.put32(entry.logical)?;
            }
        }
        encoder.put_bytes(&sidecar)?;
        Ok(buf)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if !self.writable || (!self.dirty && !self.metadata.is_dirty()) {
            return Ok(());
        }

        let trailer = self.encode_trailer()?;
        let len = trailer.len() as u64;
        let offset = if self.end + len <= self.trailer_offset {
            self.end
        } else {
            self.append_offset()
        };

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&trailer)?;
        self.file.sync_data()?;
        write_header(&mut self.file, self.levels.len() as u16, offset)?;
        self.file.sync_data()?;
        // The old trailer is dead once the header points past it
        self.file.set_len(offset + len)?;

        self.trailer_offset = offset;
        self.trailer_len = len;
        self.metadata.set_all_dirty(false);
        self.dirty = false;
        debug!(
            path = %self.path.display(),
            trailer_offset = offset,
            trailer_len = len,
            "flushed tiled file"
        );
        Ok(())
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "failed to flush tiled file on drop");
        }
    }
}

fn write_header(file: &mut File, level_count: u16, trailer_offset: u64) -> Result<(), StorageError> {
    let mut buf = [0u8; HEADER_LEN];
    let mut encoder = Encoder::new(&mut buf);
    encoder.put_bytes(&TILED_FILE_MAGIC)?;
    encoder.put16(FORMAT_VERSION)?;
    encoder.put16(level_count)?;
    encoder.put64(trailer_offset)?;

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

/// Decode the trailer at `trailer_offset`, validating every length before
/// the decoder reads it.
fn decode_trailer(
    trailer: &[u8],
    level_count: usize,
    trailer_offset: u64,
) -> Result<(Vec<Level>, MetadataContainerList), StorageError> {
    let mut decoder = Decoder::new(trailer);
    let mut levels = Vec::with_capacity(level_count);

    for i in 0..level_count {
        if decoder.remaining() < LEVEL_RECORD_LEN {
            return Err(corrupt(format!("level {i} record truncated")));
        }
        let width = decoder.get32();
        let height = decoder.get32();
        let block_width = decoder.get32();
        let block_height = decoder.get32();
        let layout = BlockLayout::from_u8(decoder.get8())
            .ok_or_else(|| corrupt(format!("level {i} has an unknown block layout")))?;
        let bits_per_pixel = decoder.get8();
        let codec = CodecKind::from_id(decoder.get16())?;
        let count = decoder.get64();

        let geometry = BlockGeometry::new(
            width,
            height,
            block_width,
            block_height,
            layout,
            bits_per_pixel,
        )
        .map_err(|e| corrupt(format!("level {i}: {e}")))?;
        if count != geometry.block_count() {
            return Err(corrupt(format!(
                "level {i} directory has {count} entries, geometry has {}",
                geometry.block_count()
            )));
        }

        let needed = (count as usize)
            .checked_mul(DIRECTORY_ENTRY_LEN)
            .ok_or_else(|| corrupt("directory size overflows"))?;
        if decoder.remaining() < needed {
            return Err(corrupt(format!("level {i} directory truncated")));
        }

        let mut directory = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry = DirectoryEntry {
                offset: decoder.get64(),
                physical: decoder.get32(),
                logical: decoder.get32(),
            };
            let entry_end = entry
                .offset
                .checked_add(entry.physical as u64)
                .ok_or_else(|| corrupt(format!("level {i} block offset overflows")))?;
            if entry.is_present() && (entry.offset < HEADER_LEN as u64 || entry_end > trailer_offset)
            {
                return Err(corrupt(format!(
                    "level {i} block at offset {} lies outside the payload area",
                    entry.offset
                )));
            }
            directory.push(entry);
        }

        levels.push(Level {
            geometry,
            codec,
            directory,
        });
    }

    let metadata = MetadataContainerList::decode_sidecar(decoder.get_slice(decoder.remaining()))?;
    Ok((levels, metadata))
}

// =============================================================================
// Public Handles
// =============================================================================

/// A pyramid file shared between accessors.
///
/// Cloning is cheap; every clone refers to the same open file.
#[derive(Debug, Clone)]
pub struct TiledFile {
    inner: Arc<Mutex<Inner>>,
}

impl TiledFile {
    /// Create (or truncate) a file for `pyramid`, every level using `codec`.
    pub fn create(
        path: impl AsRef<Path>,
        pyramid: &Pyramid,
        codec: CodecKind,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let levels = pyramid
            .levels()
            .iter()
            .map(|geometry| Level {
                geometry: *geometry,
                codec,
                directory: vec![DirectoryEntry::default(); geometry.block_count() as usize],
            })
            .collect();

        let mut inner = Inner {
            file,
            path: path.to_path_buf(),
            writable: true,
            levels,
            metadata: MetadataContainerList::new(),
            end: HEADER_LEN as u64,
            trailer_offset: HEADER_LEN as u64,
            trailer_len: 0,
            dirty: true,
        };
        inner.flush()?;

        debug!(path = %path.display(), levels = pyramid.level_count(), %codec, "created tiled file");
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Open an existing file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path.as_ref(), false)
    }

    /// Open an existing file for reading and writing.
    pub fn open_writable(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path.as_ref(), true)
    }

    fn open_with(path: &Path, writable: bool) -> Result<Self, StorageError> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_LEN as u64 {
            return Err(corrupt("file shorter than its header"));
        }

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        let mut decoder = Decoder::new(&header);
        let mut magic = [0u8; 4];
        decoder.copy_bytes(&mut magic);
        if magic != TILED_FILE_MAGIC {
            return Err(corrupt("not a tiled pyramid file"));
        }
        let version = decoder.get16();
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {version}")));
        }
        let level_count = decoder.get16() as usize;
        let trailer_offset = decoder.get64();
        if trailer_offset < HEADER_LEN as u64 || trailer_offset > file_len {
            return Err(corrupt(format!("trailer offset {trailer_offset} out of range")));
        }

        let mut trailer = Vec::with_capacity((file_len - trailer_offset) as usize);
        file.seek(SeekFrom::Start(trailer_offset))?;
        file.read_to_end(&mut trailer)?;
        let (levels, metadata) = decode_trailer(&trailer, level_count, trailer_offset)?;

        // Validates level ordering
        Pyramid::new(levels.iter().map(|l| l.geometry).collect())?;

        let end = levels
            .iter()
            .flat_map(|l| l.directory.iter())
            .filter(|e| e.is_present())
            .map(|e| e.offset + e.physical as u64)
            .fold(HEADER_LEN as u64, u64::max);

        debug!(path = %path.display(), levels = level_count, writable, "opened tiled file");
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file,
                path: path.to_path_buf(),
                writable,
                levels,
                metadata,
                end,
                trailer_offset,
                trailer_len: file_len - trailer_offset,
                dirty: false,
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    pub fn is_writable(&self) -> bool {
        self.lock().writable
    }

    pub fn level_count(&self) -> usize {
        self.lock().levels.len()
    }

    pub fn pyramid(&self) -> Result<Pyramid, StorageError> {
        Pyramid::new(self.lock().levels.iter().map(|l| l.geometry).collect())
    }

    /// Geometry, codec and fill state of every level.
    pub fn summaries(&self) -> Vec<LevelSummary> {
        self.lock()
            .levels
            .iter()
            .enumerate()
            .map(|(i, l)| LevelSummary {
                level: i,
                geometry: l.geometry,
                codec: l.codec,
                present: l.directory.iter().filter(|e| e.is_present()).count() as u64,
            })
            .collect()
    }

    /// Backend for one level.
    pub fn level(&self, level: usize) -> Result<TiledLevel, StorageError> {
        let (geometry, codec) = {
            let inner = self.lock();
            let l = inner.level(level)?;
            (l.geometry, l.codec)
        };
        Ok(TiledLevel {
            inner: Arc::clone(&self.inner),
            level,
            geometry,
            codec,
        })
    }

    /// Accessor for one level of this file (page 0).
    pub fn accessor(
        &self,
        level: usize,
        mode: AccessMode,
        registry: &CodecRegistry,
    ) -> Result<ResolutionAccessor<TiledLevel>, StorageError> {
        if mode.can_write() && !self.is_writable() {
            return Err(StorageError::AccessDenied("file opened read-only"));
        }
        let store = self.level(level)?;
        // Level count is bounded by Pyramid, so the index fits in a u8
        ResolutionAccessor::new(store, registry, 0, level as u8, mode)
    }

    /// A deep copy of the file's metadata.
    pub fn metadata(&self) -> MetadataContainerList {
        self.lock().metadata.clone()
    }

    /// Modify metadata in place; changes are written on the next flush.
    pub fn update_metadata<R>(
        &self,
        f: impl FnOnce(&mut MetadataContainerList) -> R,
    ) -> Result<R, StorageError> {
        let mut inner = self.lock();
        if !inner.writable {
            return Err(StorageError::AccessDenied("file opened read-only"));
        }
        let result = f(&mut inner.metadata);
        inner.dirty = true;
        Ok(result)
    }

    /// Write the trailer and header if anything changed.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.lock().flush()
    }
}

/// One level of a [`TiledFile`], usable as a [`BlockStore`].
#[derive(Debug, Clone)]
pub struct TiledLevel {
    inner: Arc<Mutex<Inner>>,
    level: usize,
    geometry: BlockGeometry,
    codec: CodecKind,
}

impl TiledLevel {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

impl BlockStore for TiledLevel {
    fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn codec(&self) -> CodecKind {
        self.codec
    }

    fn read_packet(&mut self, index: u64) -> Result<Option<CompressedBuffer<'static>>, StorageError> {
        self.lock().read_packet(self.level, index)
    }

    fn write_packet(
        &mut self,
        index: u64,
        packet: &CompressedBuffer<'_>,
    ) -> Result<(), StorageError> {
        self.lock().write_packet(self.level, index, packet)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.lock().flush()
    }
}
