//! Tile cache behavior under concurrent load, and remote block reads that
//! go through the cache.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use raster_pyramid::{
    AccessMode, Acquired, BlockGeometry, CodecKind, CodecRegistry, FetchError, RemoteBlockStore,
    ResolutionAccessor, StorageError, TileCache, TileId, TileState,
};

use super::test_utils::TrackingRequester;

// =============================================================================
// Single-Flight
// =============================================================================

#[test]
fn test_concurrent_acquires_issue_one_fetch() {
    const THREADS: usize = 16;
    let cache = Arc::new(TileCache::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let id = TileId::from_index(0, 42);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let acquired = cache.acquire_or_fetch(id);
                let issued = acquired.is_issued();
                (issued, acquired.wait_blocking())
            })
        })
        .collect();

    // Wait until every thread has joined the pending entry
    while cache.stats().misses + cache.stats().joins < THREADS as u64 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(cache.deliver(id, Bytes::from_static(b"tile-42")));

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|(issued, _)| *issued).count(), 1);
    for (_, outcome) in results {
        assert_eq!(outcome.unwrap(), Bytes::from_static(b"tile-42"));
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.joins, THREADS as u64 - 1);
    assert_eq!(stats.deliveries, 1);
}

#[test]
fn test_many_tiles_many_threads() {
    const THREADS: usize = 8;
    const TILES: u64 = 32;
    let cache = Arc::new(TileCache::new());

    // One producer thread answers whatever is pending
    let producer = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            let mut delivered = 0;
            while delivered < TILES {
                for index in 0..TILES {
                    let id = TileId::from_index(1, index);
                    if cache.state(id) == TileState::Pending
                        && cache.deliver(id, Bytes::from(index.to_le_bytes().to_vec()))
                    {
                        delivered += 1;
                    }
                }
                thread::yield_now();
            }
        })
    };

    let consumers: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..TILES {
                    let index = (i + t as u64 * 5) % TILES;
                    let id = TileId::from_index(1, index);
                    let payload = cache.acquire_or_fetch(id).wait_blocking().unwrap();
                    assert_eq!(payload.as_ref(), index.to_le_bytes());
                }
            })
        })
        .collect();

    for consumer in consumers {
        consumer.join().unwrap();
    }
    producer.join().unwrap();

    assert_eq!(cache.stats().deliveries, TILES);
    assert_eq!(cache.stats().misses, TILES);
    assert_eq!(cache.len(), TILES as usize);
    assert_eq!(cache.pending_count(), 0);
}

#[test]
fn test_cancel_wakes_waiters_and_discards_late_payload() {
    let cache = Arc::new(TileCache::new());
    let id = TileId::from_index(0, 7);
    let waiter = match cache.acquire_or_fetch(id) {
        Acquired::Issued(waiter) => waiter,
        other => panic!("expected Issued, got {other:?}"),
    };

    let blocked = {
        let waiter = waiter.clone();
        thread::spawn(move || waiter.wait_blocking())
    };
    thread::sleep(Duration::from_millis(20));

    assert!(cache.cancel(id));
    assert_eq!(blocked.join().unwrap(), Err(FetchError::Canceled));

    // The payload shows up anyway
    assert!(!cache.deliver(id, Bytes::from_static(b"late")));
    assert_eq!(cache.state(id), TileState::Empty);
    assert_eq!(cache.stats().discarded, 1);

    // A later request issues a fresh fetch
    assert!(cache.acquire_or_fetch(id).is_issued());
}

#[test]
fn test_cancel_deliver_race_settles_once() {
    for round in 0..200u64 {
        let cache = Arc::new(TileCache::new());
        let id = TileId::from_index(0, round);
        let waiter = match cache.acquire_or_fetch(id) {
            Acquired::Issued(waiter) => waiter,
            other => panic!("expected Issued, got {other:?}"),
        };
        let barrier = Arc::new(Barrier::new(2));

        let canceller = {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.cancel(id)
            })
        };
        barrier.wait();
        let delivered = cache.deliver(id, Bytes::from_static(b"payload"));
        let canceled = canceller.join().unwrap();

        // Exactly one of them completes the fetch, and waiters agree with it
        assert!(delivered ^ canceled, "round {round}");
        match waiter.wait_blocking() {
            Ok(payload) => {
                assert!(delivered);
                assert_eq!(payload, Bytes::from_static(b"payload"));
                assert_eq!(cache.state(id), TileState::Ready);
            }
            Err(e) => {
                assert!(canceled);
                assert!(e.is_canceled());
                assert_eq!(cache.state(id), TileState::Empty);
            }
        }
    }
}

#[test]
fn test_capacity_eviction_keeps_recent_tiles() {
    let cache = TileCache::with_capacity(1000);
    for index in 0..5 {
        let id = TileId::from_index(0, index);
        assert!(cache.acquire_or_fetch(id).is_issued());
        cache.deliver(id, Bytes::from(vec![index as u8; 300]));
    }

    assert!(cache.size_bytes() <= 1000);
    assert_eq!(cache.len(), 3);
    assert!(cache.get(TileId::from_index(0, 0)).is_none());
    assert!(cache.get(TileId::from_index(0, 4)).is_some());
}

// =============================================================================
// Remote Block Store
// =============================================================================

fn remote_store(
    cache: &Arc<TileCache>,
    requester: &Arc<TrackingRequester>,
    codec: CodecKind,
) -> RemoteBlockStore {
    RemoteBlockStore::new(
        Arc::clone(cache),
        Arc::clone(requester) as _,
        Arc::new(CodecRegistry::with_builtin()),
        BlockGeometry::tiles(4, 4, 2, 2, 8).unwrap(),
        codec,
        0,
        0,
    )
}

#[test]
fn test_remote_reads_share_one_request() {
    let cache = Arc::new(TileCache::new());
    let requester = Arc::new(TrackingRequester::new());
    let registry = CodecRegistry::with_builtin();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = remote_store(&cache, &requester, CodecKind::Identity);
            let registry = registry.clone();
            thread::spawn(move || {
                let mut accessor =
                    ResolutionAccessor::new(store, &registry, 0, 0, AccessMode::ReadOnly).unwrap();
                accessor.read_block(2, 2)
            })
        })
        .collect();

    let id = TileId::from_index(0, 3);
    while cache.stats().misses + cache.stats().joins < 4 {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(cache.deliver(id, Bytes::from_static(&[1, 2, 3, 4])));

    for reader in readers {
        assert_eq!(reader.join().unwrap().unwrap(), vec![1, 2, 3, 4]);
    }
    assert_eq!(requester.request_count(), 1);
    assert_eq!(requester.requested(), vec![(0, id)]);
}

#[test]
fn test_remote_read_times_out_and_recovers() {
    let cache = Arc::new(TileCache::new());
    let requester = Arc::new(TrackingRequester::new());
    let registry = CodecRegistry::with_builtin();
    let store = remote_store(&cache, &requester, CodecKind::RunLength)
        .with_timeout(Duration::from_millis(30));
    let mut accessor = ResolutionAccessor::new(store, &registry, 0, 0, AccessMode::ReadOnly).unwrap();

    assert!(matches!(
        accessor.read_block(0, 0),
        Err(StorageError::Fetch(FetchError::Failed(_)))
    ));
    let id = TileId::from_index(0, 0);
    assert_eq!(cache.state(id), TileState::Empty);
    assert_eq!(requester.request_count(), 1);

    // The retry asks again; answer it from another thread
    let responder = {
        let cache = Arc::clone(&cache);
        let requester = Arc::clone(&requester);
        thread::spawn(move || {
            while requester.request_count() < 2 {
                thread::sleep(Duration::from_millis(1));
            }
            // PackBits, one run per 2-byte row
            cache.deliver(id, Bytes::from_static(&[0xFF, 0x09, 0xFF, 0x09]))
        })
    };
    let store = remote_store(&cache, &requester, CodecKind::RunLength)
        .with_timeout(Duration::from_secs(5));
    let mut accessor = ResolutionAccessor::new(store, &registry, 0, 0, AccessMode::ReadOnly).unwrap();
    assert_eq!(accessor.read_block(0, 0).unwrap(), vec![9, 9, 9, 9]);
    assert!(responder.join().unwrap());
    assert_eq!(requester.request_count(), 2);
}

#[test]
fn test_remote_store_is_read_only() {
    let cache = Arc::new(TileCache::new());
    let requester = Arc::new(TrackingRequester::new());
    let registry = CodecRegistry::with_builtin();
    let store = remote_store(&cache, &requester, CodecKind::Identity);
    let mut accessor =
        ResolutionAccessor::new(store, &registry, 0, 0, AccessMode::ReadWrite).unwrap();

    assert!(matches!(
        accessor.write_block(0, 0, &[0; 4]),
        Err(StorageError::NotSupported(_))
    ));
    assert_eq!(requester.request_count(), 0);
}

#[test]
fn test_remote_fetch_failure_reaches_reader() {
    let cache = Arc::new(TileCache::new());
    let requester = Arc::new(TrackingRequester::new());
    let registry = CodecRegistry::with_builtin();
    let store = remote_store(&cache, &requester, CodecKind::Identity);

    let reader = thread::spawn(move || {
        let mut accessor = ResolutionAccessor::new(store, &registry, 0, 0, AccessMode::ReadOnly).unwrap();
        accessor.read_block(0, 2)
    });

    let id = TileId::from_index(0, 2);
    while cache.state(id) != TileState::Pending {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(cache.fail(id, "server error 3/1: no such tile"));

    match reader.join().unwrap() {
        Err(StorageError::Fetch(FetchError::Failed(message))) => {
            assert!(message.contains("no such tile"));
        }
        other => panic!("expected fetch failure, got {other:?}"),
    }
    assert_eq!(cache.state(id), TileState::Empty);
}
