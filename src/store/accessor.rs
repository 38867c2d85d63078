//! Resolution accessor.
//!
//! A [`ResolutionAccessor`] is bound to one (page, level, mode) triple for
//! its lifetime. It validates block coordinates, drives the level's codec
//! and hands compressed packets to a [`BlockStore`].
//!
//! ```text
//!            read_block / write_block
//!   Open ─────────────────────────────▶ Reading | Writing
//!     │                                      │
//!     └──────────────close()─────────────────┴──▶ Closed
//! ```
//!
//! `ReadWrite` accessors move freely between Reading and Writing. Every
//! operation on a Closed accessor fails with `InvalidState`.
//!
//! The codec is reset before every block, so blocks never depend on carried
//! coding state and can be read in any order.

use tracing::{debug, warn};

use crate::codec::{BlockCodec, CodecKind, CodecRegistry, CompressedBuffer};
use crate::error::{CodecError, StorageError};
use crate::geometry::BlockGeometry;

use super::BlockStore;

/// What an accessor is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, AccessMode::ReadOnly | AccessMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, AccessMode::WriteOnly | AccessMode::ReadWrite)
    }
}

/// Lifecycle state of an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessorState {
    Open,
    Reading,
    Writing,
    Closed,
}

/// Block-granular reader/writer for one resolution level.
pub struct ResolutionAccessor<S: BlockStore> {
    store: S,
    codec: Box<dyn BlockCodec>,
    geometry: BlockGeometry,
    page: u32,
    level: u8,
    mode: AccessMode,
    state: AccessorState,
}

impl<S: BlockStore> ResolutionAccessor<S> {
    /// Bind an accessor to `store`, creating its codec from `registry`.
    pub fn new(
        store: S,
        registry: &CodecRegistry,
        page: u32,
        level: u8,
        mode: AccessMode,
    ) -> Result<Self, StorageError> {
        let geometry = store.geometry();
        let codec = registry.create(store.codec(), &geometry)?;
        Ok(Self {
            store,
            codec,
            geometry,
            page,
            level,
            mode,
            state: AccessorState::Open,
        })
    }

    pub fn geometry(&self) -> &BlockGeometry {
        &self.geometry
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn state(&self) -> AccessorState {
        self.state
    }

    pub fn codec(&self) -> CodecKind {
        self.codec.kind()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.state == AccessorState::Closed {
            return Err(StorageError::InvalidState("accessor is closed".to_string()));
        }
        Ok(())
    }

    /// Read and decompress the block whose origin is pixel `(x, y)`.
    pub fn read_block(&mut self, x: u32, y: u32) -> Result<Vec<u8>, StorageError> {
        self.ensure_open()?;
        if !self.mode.can_read() {
            return Err(StorageError::AccessDenied("accessor is write-only"));
        }

        let index = self.geometry.block_index(x, y)?;
        let packet = self
            .store
            .read_packet(index)?
            .ok_or(StorageError::NotFound { x, y })?;

        let data = decode_block(self.codec.as_mut(), &self.geometry, y, &packet)?;
        self.state = AccessorState::Reading;

        debug!(
            page = self.page,
            level = self.level,
            index,
            physical = packet.physical_len(),
            logical = data.len(),
            "read block"
        );
        Ok(data)
    }

    /// Compress `data` and store it as the block whose origin is pixel `(x, y)`.
    ///
    /// `data` must be exactly the block's raw length: full tiles, or the
    /// remaining rows for the last strip.
    pub fn write_block(&mut self, x: u32, y: u32, data: &[u8]) -> Result<(), StorageError> {
        self.ensure_open()?;
        if !self.mode.can_write() {
            return Err(StorageError::AccessDenied("accessor is read-only"));
        }

        let index = self.geometry.block_index(x, y)?;
        let expected = self.geometry.raw_block_len(y);
        if data.len() != expected {
            return Err(CodecError::InvalidInput(format!(
                "block at ({x}, {y}) needs {expected} bytes, got {}",
                data.len()
            ))
            .into());
        }

        if let Some(next) = self.store.next_write_index() {
            if index != next {
                return Err(StorageError::InvalidState(format!(
                    "blocks must be written in order: expected block {next}, got {index}"
                )));
            }
        }

        self.codec.reset();
        self.codec
            .set_subset(self.geometry.block_width(), self.geometry.block_rows(y));
        let packet = self.codec.compress(data)?;
        self.store.write_packet(index, &packet)?;
        self.state = AccessorState::Writing;

        debug!(
            page = self.page,
            level = self.level,
            index,
            physical = packet.physical_len(),
            logical = packet.logical_len(),
            "wrote block"
        );
        Ok(())
    }

    /// Flush the backend and close the accessor. Idempotent.
    pub fn close(&mut self) -> Result<(), StorageError> {
        if self.state == AccessorState::Closed {
            return Ok(());
        }
        self.state = AccessorState::Closed;
        self.store.flush()
    }
}

impl<S: BlockStore> Drop for ResolutionAccessor<S> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(level = self.level, error = %e, "flush on drop failed");
        }
    }
}

/// Decompress one packet for the block starting at row `y`.
pub(crate) fn decode_block(
    codec: &mut dyn BlockCodec,
    geometry: &BlockGeometry,
    y: u32,
    packet: &CompressedBuffer<'_>,
) -> Result<Vec<u8>, StorageError> {
    if packet.codec() != codec.kind() {
        return Err(CodecError::CorruptData(format!(
            "block was written with {}, level uses {}",
            packet.codec(),
            codec.kind()
        ))
        .into());
    }

    let expected = geometry.raw_block_len(y);
    if packet.logical_len() != expected {
        return Err(CodecError::CorruptData(format!(
            "block records {} raw bytes, geometry needs {expected}",
            packet.logical_len()
        ))
        .into());
    }

    codec.reset();
    codec.set_subset(geometry.block_width(), geometry.block_rows(y));
    let mut out = vec![0u8; expected];
    let written = codec.decompress(packet, &mut out)?;
    out.truncate(written);
    Ok(out)
}
