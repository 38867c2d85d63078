//! Block storage.
//!
//! Resolution accessors read and write compressed blocks through the
//! [`BlockStore`] trait. Each backend instance serves one resolution level.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │           ResolutionAccessor<S>                 │
//! │   coordinates → block index, codec, mode/state  │
//! └───────────────────────┬─────────────────────────┘
//!                         │ BlockStore
//!        ┌────────────────┼─────────────────┬──────────────┐
//!        ▼                ▼                 ▼              ▼
//!   TiledLevel        StripFile      RemoteBlockStore  MemoryStore
//!   (one file,        (append-only,  (TileCache +      (in-memory)
//!    directory)        sequential)    TileRequester)
//! ```

mod accessor;
mod remote;
mod strip_file;
mod tiled_file;

pub use accessor::{AccessMode, AccessorState, ResolutionAccessor};
pub use remote::RemoteBlockStore;
pub use strip_file::StripFile;
pub use tiled_file::{LevelSummary, TiledFile, TiledLevel};

pub(crate) use accessor::decode_block;

use crate::codec::{CodecKind, CompressedBuffer};
use crate::error::StorageError;
use crate::geometry::BlockGeometry;

/// Magic bytes at the start of a tiled pyramid file.
pub const TILED_FILE_MAGIC: [u8; 4] = *b"RPYR";

/// Magic bytes at the start of a strip file.
pub const STRIP_FILE_MAGIC: [u8; 4] = *b"RSTR";

/// Format version written by this crate.
pub const FORMAT_VERSION: u16 = 1;

/// Storage backend for the compressed blocks of one resolution level.
///
/// Block indices are raster order within the level's grid.
pub trait BlockStore: Send {
    fn geometry(&self) -> BlockGeometry;

    /// Codec every block of this level is compressed with.
    fn codec(&self) -> CodecKind;

    /// The packet stored for `index`, or `None` if the block was never written.
    fn read_packet(&mut self, index: u64) -> Result<Option<CompressedBuffer<'static>>, StorageError>;

    /// Store (or overwrite) the packet for `index`.
    fn write_packet(&mut self, index: u64, packet: &CompressedBuffer<'_>)
        -> Result<(), StorageError>;

    /// For backends that only accept blocks in order: the index the next
    /// write must use. `None` for random-access backends.
    fn next_write_index(&self) -> Option<u64> {
        None
    }

    /// Persist everything written so far.
    fn flush(&mut self) -> Result<(), StorageError>;
}

/// Keeps packets in memory. Useful as scratch storage and in tests.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    geometry: BlockGeometry,
    codec: CodecKind,
    blocks: Vec<Option<CompressedBuffer<'static>>>,
    sequential: bool,
    written: u64,
}

impl MemoryStore {
    pub fn new(geometry: BlockGeometry, codec: CodecKind) -> Self {
        Self {
            geometry,
            codec,
            blocks: vec![None; geometry.block_count() as usize],
            sequential: false,
            written: 0,
        }
    }

    /// Only accept blocks in increasing order, like an append-only file.
    pub fn sequential(mut self) -> Self {
        self.sequential = true;
        self
    }

    /// Number of blocks holding data.
    pub fn present(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }
}

impl BlockStore for MemoryStore {
    fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn codec(&self) -> CodecKind {
        self.codec
    }

    fn read_packet(&mut self, index: u64) -> Result<Option<CompressedBuffer<'static>>, StorageError> {
        Ok(self.blocks.get(index as usize).cloned().flatten())
    }

    fn write_packet(
        &mut self,
        index: u64,
        packet: &CompressedBuffer<'_>,
    ) -> Result<(), StorageError> {
        let slot = self.blocks.get_mut(index as usize).ok_or_else(|| {
            StorageError::InvalidState(format!("block {index} outside the level"))
        })?;
        *slot = Some(packet.clone().into_owned());
        self.written = self.written.max(index + 1);
        Ok(())
    }

    fn next_write_index(&self) -> Option<u64> {
        self.sequential.then_some(self.written)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
