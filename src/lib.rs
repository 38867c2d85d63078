//! # raster-pyramid
//!
//! Tiled, multi-resolution raster storage and retrieval.
//!
//! Large raster images are stored as a pyramid of resolution levels. Each
//! level is cut into fixed-size blocks (strips or tiles), and every block is
//! compressed with a pluggable codec. Blocks come from local files or from a
//! remote tile server over a streaming protocol.
//!
//! ## Features
//!
//! - **Pluggable codecs**: identity, PackBits run-length, CCITT Group 4 and
//!   deflate built in; vendor codecs register through [`CodecRegistry`]
//! - **Local backends**: a seekable pyramid file with a block directory, and
//!   an append-only strip file
//! - **Single-flight tile cache**: at most one outstanding fetch per tile,
//!   with blocking and async waits
//! - **Streaming tile protocol**: a tokio client that delivers tiles into the
//!   cache as they arrive
//!
//! ## Architecture
//!
//! - [`io`] - Little-endian binary encoder/decoder
//! - [`codec`] - Block codecs, compressed buffers and the codec registry
//! - [`geometry`] - Block geometry, tile ids and pyramids
//! - [`store`] - Resolution accessors and storage backends
//! - [`tile`] - Tile cache
//! - [`remote`] - Wire protocol, receive loop and connection
//! - [`metadata`] - Sidecar metadata records
//! - [`config`] - CLI configuration
//!
//! ## Example
//!
//! ```rust,no_run
//! use raster_pyramid::{
//!     AccessMode, BlockGeometry, CodecKind, CodecRegistry, Pyramid, TiledFile,
//! };
//!
//! # fn main() -> Result<(), raster_pyramid::StorageError> {
//! let pyramid = Pyramid::new(vec![
//!     BlockGeometry::tiles(4, 4, 2, 2, 8)?,
//!     BlockGeometry::tiles(2, 2, 2, 2, 8)?,
//! ])?;
//! let registry = CodecRegistry::with_builtin();
//!
//! let file = TiledFile::create("image.rpyr", &pyramid, CodecKind::Deflate)?;
//! let mut level0 = file.accessor(0, AccessMode::ReadWrite, &registry)?;
//! level0.write_block(0, 0, &[1, 2, 3, 4])?;
//! assert_eq!(level0.read_block(0, 0)?, vec![1, 2, 3, 4]);
//! level0.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod metadata;
pub mod remote;
pub mod store;
pub mod tile;

// Re-export commonly used types
pub use codec::{
    BlockCodec, CodecKind, CodecRegistry, CompressedBuffer, DeflateCodec, FaxGroup4Codec,
    IdentityCodec, PacketData, RunLengthCodec,
};
pub use error::{CodecError, FetchError, ProtocolError, StorageError};
pub use geometry::{BlockGeometry, BlockLayout, Pyramid, TileId};
pub use metadata::{MetadataContainerList, MetadataRecord, RawMetadata, TextMetadata};
pub use remote::{ImageSizes, ProtocolHandler, RemoteConnection, Resolution, ResolutionMap};
pub use store::{
    AccessMode, AccessorState, BlockStore, MemoryStore, RemoteBlockStore, ResolutionAccessor,
    StripFile, TiledFile,
};
pub use tile::{
    Acquired, CacheStats, TileCache, TileRequester, TileState, TileWaiter,
    DEFAULT_TILE_CACHE_CAPACITY,
};
