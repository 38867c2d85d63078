//! Read-only backend fed by the tile cache.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::{CodecKind, CodecRegistry, CompressedBuffer};
use crate::error::{FetchError, StorageError};
use crate::geometry::{BlockGeometry, TileId};
use crate::tile::{Acquired, TileCache, TileRequester};

use super::{decode_block, BlockStore};

/// One level of a remote image.
///
/// A miss creates a Pending cache entry, sends a request through the
/// [`TileRequester`] and waits for the payload. Payloads are compressed with
/// the level's codec; their logical size is the raw block length.
#[derive(Clone)]
pub struct RemoteBlockStore {
    cache: Arc<TileCache>,
    requester: Arc<dyn TileRequester>,
    registry: Arc<CodecRegistry>,
    geometry: BlockGeometry,
    codec: CodecKind,
    page: u32,
    level: u8,
    timeout: Option<Duration>,
}

impl RemoteBlockStore {
    pub fn new(
        cache: Arc<TileCache>,
        requester: Arc<dyn TileRequester>,
        registry: Arc<CodecRegistry>,
        geometry: BlockGeometry,
        codec: CodecKind,
        page: u32,
        level: u8,
    ) -> Self {
        Self {
            cache,
            requester,
            registry,
            geometry,
            codec,
            page,
            level,
            timeout: None,
        }
    }

    /// Give up on blocking reads after `timeout`.
    ///
    /// The tile stays Pending, so a later read can still pick it up.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    fn acquire(&self, index: u64) -> Result<(TileId, Acquired), StorageError> {
        if index >= self.geometry.block_count() {
            return Err(StorageError::InvalidState(format!(
                "block {index} outside the level"
            )));
        }
        let id = TileId::try_from_index(self.level, index).ok_or_else(|| {
            StorageError::InvalidState(format!("block {index} does not fit a tile id"))
        })?;
        let acquired = self.cache.acquire_or_fetch(id);
        if acquired.is_issued() {
            debug!(tile = %id, page = self.page, "requesting remote tile");
            if let Err(e) = self.requester.request(self.page, &[id]) {
                self.cache.fail(id, e.to_string());
            }
        }
        Ok((id, acquired))
    }

    /// Fetch and decompress the block at pixel `(x, y)` without blocking a thread.
    pub async fn fetch_block(&self, x: u32, y: u32) -> Result<Vec<u8>, StorageError> {
        let index = self.geometry.block_index(x, y)?;
        let (_, acquired) = self.acquire(index)?;
        let payload = acquired.wait().await?;

        let packet =
            CompressedBuffer::borrowed(self.codec, &payload, self.geometry.raw_block_len(y));
        let mut codec = self.registry.create(self.codec, &self.geometry)?;
        decode_block(codec.as_mut(), &self.geometry, y, &packet)
    }
}

impl BlockStore for RemoteBlockStore {
    fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn codec(&self) -> CodecKind {
        self.codec
    }

    /// Blocks the calling thread until the tile arrives. Do not call from
    /// an async task; use [`RemoteBlockStore::fetch_block`] there.
    fn read_packet(&mut self, index: u64) -> Result<Option<CompressedBuffer<'static>>, StorageError> {
        let (id, acquired) = self.acquire(index)?;
        let payload = match acquired {
            Acquired::Ready(payload) => payload,
            Acquired::Joined(waiter) | Acquired::Issued(waiter) => match self.timeout {
                Some(timeout) => match waiter.wait_timeout(timeout) {
                    Some(result) => result?,
                    None => {
                        // Drop the Pending entry so the next read asks again
                        let reason = format!("tile {id} not delivered within {timeout:?}");
                        warn!(tile = %id, ?timeout, "remote tile timed out");
                        self.cache.fail(id, reason.clone());
                        return Err(FetchError::Failed(reason).into());
                    }
                },
                None => waiter.wait_blocking()?,
            },
        };

        let y = self
            .geometry
            .block_origin(index)
            .map(|(_, y)| y)
            .unwrap_or_default();
        Ok(Some(CompressedBuffer::owned(
            self.codec,
            payload.to_vec(),
            self.geometry.raw_block_len(y),
        )))
    }

    fn write_packet(
        &mut self,
        _index: u64,
        _packet: &CompressedBuffer<'_>,
    ) -> Result<(), StorageError> {
        Err(StorageError::NotSupported("remote images are read-only"))
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}
