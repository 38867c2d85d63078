//! Tile cache layer.
//!
//! The cache sits between the consumers of remote blocks and whatever
//! delivers them:
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │  RemoteBlockStore    │      │  ProtocolHandler     │
//! │  (acquire + wait)    │      │  (deliver / fail)    │
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            │                             │
//!            ▼                             ▼
//! ┌─────────────────────────────────────────────────────┐
//! │                     TileCache                       │
//! │   pending: TileId → waiter slot                     │
//! │   ready:   LRU of TileId → Bytes (size-bounded)     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`TileCache`]: single-flight map from [`TileId`](crate::geometry::TileId) to tile state
//! - [`Acquired`]: outcome of a lookup (ready, joined or newly issued)
//! - [`TileWaiter`]: blocking and async wait for a pending tile
//! - [`TileRequester`]: how a cache miss is turned into a fetch

mod cache;

pub use cache::{
    Acquired, CacheStats, TileCache, TileState, TileWaiter, DEFAULT_TILE_CACHE_CAPACITY,
};

use crate::error::FetchError;
use crate::geometry::TileId;

/// Issues fetches for tiles that were just marked Pending.
///
/// Implementations must not block: the payload arrives later through
/// [`TileCache::deliver`]. A returned error means the request never left, and
/// the caller fails the Pending entry with it.
pub trait TileRequester: Send + Sync {
    fn request(&self, page: u32, ids: &[TileId]) -> Result<(), FetchError>;
}
