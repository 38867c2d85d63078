//! Concurrent tile cache with single-flight fetches.
//!
//! The cache is the only owner of tile entries. Callers hold [`TileId`] keys
//! and [`TileWaiter`] handles, never references into the cache, and every
//! state change goes through one of the cache's methods.
//!
//! # Entry Lifecycle
//!
//! ```text
//!            acquire_or_fetch (miss)
//!   Empty ─────────────────────────▶ Pending ──deliver──▶ Ready ──evict/clear──▶ Empty
//!                                      │
//!                                      ├──fail────▶ Empty (waiters see Failed)
//!                                      └──cancel──▶ Empty (waiters see Canceled)
//! ```
//!
//! At most one Pending entry exists per tile. A second caller asking for a
//! Pending tile joins the existing waiters instead of issuing another fetch.
//!
//! # Late Deliveries
//!
//! A `deliver` for a tile that is not Pending (it was canceled, failed, or
//! never requested) is discarded. Its payload is not cached.
//!
//! # Size-Based Eviction
//!
//! Ready payloads are kept in an LRU bounded by total byte size. Pending
//! entries are never evicted.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::FetchError;
use crate::geometry::TileId;

/// Default cache capacity: 64MB of tile payloads
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Default maximum number of Ready entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 10_000;

type Outcome = Result<Bytes, FetchError>;

// =============================================================================
// Tile State
// =============================================================================

/// Observable state of one tile in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// No entry
    Empty,
    /// A fetch is outstanding
    Pending,
    /// Payload available
    Ready,
}

/// Counters describing cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests answered from a Ready entry
    pub hits: u64,
    /// Requests that created a Pending entry
    pub misses: u64,
    /// Requests that joined an existing Pending entry
    pub joins: u64,
    /// Payloads accepted by `deliver`
    pub deliveries: u64,
    /// Payloads dropped because no Pending entry existed
    pub discarded: u64,
}

// =============================================================================
// Waiter Slot
// =============================================================================

/// Completion slot shared by everyone waiting on one fetch.
///
/// Blocking waiters park on the condvar; async waiters on the `Notify`.
#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<Outcome>>,
    arrived: Condvar,
    notify: Notify,
}

impl Slot {
    fn outcome(&self) -> MutexGuard<'_, Option<Outcome>> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store the outcome (first one wins) and wake every waiter.
    fn complete(&self, outcome: Outcome) {
        {
            let mut slot = self.outcome();
            if slot.is_some() {
                return;
            }
            *slot = Some(outcome);
        }
        self.arrived.notify_all();
        self.notify.notify_waiters();
    }
}

/// Handle to the outcome of a pending fetch.
///
/// Cloning a waiter does not issue anything; all clones observe the same
/// outcome.
#[derive(Clone)]
pub struct TileWaiter {
    id: TileId,
    slot: Arc<Slot>,
}

impl TileWaiter {
    pub fn tile_id(&self) -> TileId {
        self.id
    }

    /// The outcome, if the fetch has already completed.
    pub fn try_result(&self) -> Option<Outcome> {
        self.slot.outcome().clone()
    }

    /// Block the calling thread until the fetch completes.
    ///
    /// Must not be called from inside an async task; use [`TileWaiter::wait`].
    pub fn wait_blocking(&self) -> Outcome {
        let mut guard = self.slot.outcome();
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = self
                .slot
                .arrived
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`; `None` if the fetch is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let guard = self.slot.outcome();
        let (guard, _) = self
            .slot
            .arrived
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Wait asynchronously until the fetch completes.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.slot.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();

            if let Some(outcome) = self.try_result() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for TileWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileWaiter")
            .field("id", &self.id)
            .field("complete", &self.try_result().is_some())
            .finish()
    }
}

/// Result of [`TileCache::acquire_or_fetch`].
#[derive(Debug)]
pub enum Acquired {
    /// The tile was cached
    Ready(Bytes),

    /// Another caller's fetch is outstanding; wait on it
    Joined(TileWaiter),

    /// A Pending entry was created. The caller must issue the fetch and
    /// complete it through `deliver`, `fail` or `cancel`.
    Issued(TileWaiter),
}

impl Acquired {
    /// True if this caller is responsible for issuing the fetch.
    pub fn is_issued(&self) -> bool {
        matches!(self, Acquired::Issued(_))
    }

    /// Wait (blocking) for the payload regardless of how it was acquired.
    pub fn wait_blocking(self) -> Outcome {
        match self {
            Acquired::Ready(bytes) => Ok(bytes),
            Acquired::Joined(waiter) | Acquired::Issued(waiter) => waiter.wait_blocking(),
        }
    }

    /// Wait (async) for the payload regardless of how it was acquired.
    pub async fn wait(self) -> Outcome {
        match self {
            Acquired::Ready(bytes) => Ok(bytes),
            Acquired::Joined(waiter) | Acquired::Issued(waiter) => waiter.wait().await,
        }
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct Inner {
    pending: HashMap<TileId, Arc<Slot>>,
    ready: LruCache<TileId, Bytes>,
    ready_bytes: usize,
    stats: CacheStats,
}

impl Inner {
    /// Insert a Ready payload and evict LRU entries beyond `max_size`.
    fn insert_ready(&mut self, id: TileId, data: Bytes, max_size: usize) {
        let size = data.len();
        if let Some((_, old)) = self.ready.push(id, data) {
            self.ready_bytes = self.ready_bytes.saturating_sub(old.len());
        }
        self.ready_bytes += size;

        while self.ready_bytes > max_size {
            match self.ready.pop_lru() {
                Some((evicted, data)) => {
                    trace!(tile = %evicted, "evicting tile");
                    self.ready_bytes = self.ready_bytes.saturating_sub(data.len());
                }
                None => break,
            }
        }
    }
}

/// Concurrent map from tile id to tile state.
///
/// All mutation is serialized through a single lock. Waking waiters happens
/// after the lock is released.
///
/// # Example
///
/// ```
/// use raster_pyramid::tile::{Acquired, TileCache};
/// use raster_pyramid::geometry::TileId;
/// use bytes::Bytes;
///
/// let cache = TileCache::new();
/// let id = TileId::from_index(0, 3);
///
/// let waiter = match cache.acquire_or_fetch(id) {
///     Acquired::Issued(waiter) => waiter,
///     _ => unreachable!("cache starts empty"),
/// };
///
/// // ... issue the fetch, then when bytes arrive:
/// cache.deliver(id, Bytes::from_static(b"tile"));
/// assert_eq!(waiter.wait_blocking().unwrap(), Bytes::from_static(b"tile"));
/// ```
pub struct TileCache {
    inner: Mutex<Inner>,
    max_size: usize,
}

impl TileCache {
    /// Create a tile cache with default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a tile cache holding at most `max_size` bytes of Ready payloads.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a tile cache with byte capacity and a maximum Ready entry count.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                ready: LruCache::new(entries),
                ready_bytes: 0,
                stats: CacheStats::default(),
            }),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a tile, creating a Pending entry on a miss.
    ///
    /// Exactly one caller receives [`Acquired::Issued`] per fetch; everyone
    /// arriving while it is outstanding receives [`Acquired::Joined`].
    pub fn acquire_or_fetch(&self, id: TileId) -> Acquired {
        let mut inner = self.lock();

        if let Some(data) = inner.ready.get(&id).cloned() {
            inner.stats.hits += 1;
            return Acquired::Ready(data);
        }

        if let Some(slot) = inner.pending.get(&id).cloned() {
            inner.stats.joins += 1;
            trace!(tile = %id, "joining pending fetch");
            return Acquired::Joined(TileWaiter { id, slot });
        }

        inner.stats.misses += 1;
        let slot = Arc::new(Slot::default());
        inner.pending.insert(id, Arc::clone(&slot));
        debug!(tile = %id, "tile pending");
        Acquired::Issued(TileWaiter { id, slot })
    }

    /// Complete a Pending tile with its payload.
    ///
    /// Returns `false` (and drops the payload) when the tile is not Pending.
    pub fn deliver(&self, id: TileId, data: Bytes) -> bool {
        let slot = {
            let mut inner = self.lock();
            match inner.pending.remove(&id) {
                Some(slot) => {
                    inner.stats.deliveries += 1;
                    inner.insert_ready(id, data.clone(), self.max_size);
                    slot
                }
                None => {
                    inner.stats.discarded += 1;
                    debug!(tile = %id, bytes = data.len(), "discarding unrequested tile");
                    return false;
                }
            }
        };

        debug!(tile = %id, bytes = data.len(), "tile ready");
        slot.complete(Ok(data));
        true
    }

    /// Fail a Pending tile; its waiters receive [`FetchError::Failed`].
    pub fn fail(&self, id: TileId, reason: impl Into<String>) -> bool {
        self.complete_pending(id, FetchError::Failed(reason.into()))
    }

    /// Cancel a Pending tile; its waiters receive [`FetchError::Canceled`].
    ///
    /// Idempotent, and a no-op for Ready or absent tiles.
    pub fn cancel(&self, id: TileId) -> bool {
        self.complete_pending(id, FetchError::Canceled)
    }

    fn complete_pending(&self, id: TileId, error: FetchError) -> bool {
        let slot = self.lock().pending.remove(&id);
        match slot {
            Some(slot) => {
                debug!(tile = %id, %error, "tile fetch ended without payload");
                slot.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every Pending tile with the same error. Returns how many were failed.
    pub fn fail_all(&self, error: FetchError) -> usize {
        let slots: Vec<Arc<Slot>> = {
            let mut inner = self.lock();
            inner.pending.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &slots {
            slot.complete(Err(error.clone()));
        }
        slots.len()
    }

    /// Cancel every Pending tile. Returns how many were canceled.
    pub fn cancel_all(&self) -> usize {
        self.fail_all(FetchError::Canceled)
    }

    /// Remove a Ready tile. Pending tiles are left alone.
    pub fn evict(&self, id: TileId) -> bool {
        let mut inner = self.lock();
        match inner.ready.pop(&id) {
            Some(data) => {
                inner.ready_bytes = inner.ready_bytes.saturating_sub(data.len());
                true
            }
            None => false,
        }
    }

    /// Remove all Ready tiles. Pending tiles are left alone.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ready.clear();
        inner.ready_bytes = 0;
    }

    /// Get a Ready tile without creating an entry on a miss.
    pub fn get(&self, id: TileId) -> Option<Bytes> {
        self.lock().ready.get(&id).cloned()
    }

    pub fn state(&self, id: TileId) -> TileState {
        let inner = self.lock();
        if inner.ready.contains(&id) {
            TileState::Ready
        } else if inner.pending.contains_key(&id) {
            TileState::Pending
        } else {
            TileState::Empty
        }
    }

    /// Number of Ready tiles.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Total bytes of Ready payloads.
    pub fn size_bytes(&self) -> usize {
        self.lock().ready_bytes
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}
