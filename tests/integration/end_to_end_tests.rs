//! End-to-end: build a pyramid on disk, serve its packets from a tile
//! server, and read the same pixels back through the remote path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use raster_pyramid::remote::protocol::{encode_image_size, encode_tile, Resolution};
use raster_pyramid::{
    AccessMode, BlockStore, CodecKind, CodecRegistry, ImageSizes, ProtocolHandler,
    RemoteBlockStore, RemoteConnection, ResolutionAccessor, ResolutionMap, TileCache, TileId,
    TiledFile,
};
use tempfile::tempdir;
use tokio::time::timeout;

use super::test_utils::{noise, two_level_pyramid, MockTileServer, Reply};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_blocked_reader_receives_streamed_tile() {
    let dir = tempdir().unwrap();
    let registry = CodecRegistry::with_builtin();

    // Local side: a 2-level identity pyramid with four level-0 tiles
    let file = TiledFile::create(
        dir.path().join("local.rpyr"),
        &two_level_pyramid(),
        CodecKind::Identity,
    )
    .unwrap();
    let mut level0 = file.accessor(0, AccessMode::ReadWrite, &registry).unwrap();
    for (x, y) in [(0, 0), (2, 0), (0, 2), (2, 2)] {
        let value = (x + y * 4) as u8;
        level0.write_block(x, y, &[value; 4]).unwrap();
    }
    assert_eq!(level0.read_block(0, 0).unwrap(), vec![0; 4]);
    level0.close().unwrap();

    // Remote side: a reader thread blocks until tile (0, 3) streams in
    let cache = Arc::new(TileCache::new());
    let id = TileId::from_index(0, 3);
    let reader = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.acquire_or_fetch(id).wait_blocking())
    };
    while cache.pending_count() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let handler = ProtocolHandler::new(
        Arc::clone(&cache),
        Arc::new(ImageSizes::new()),
        Arc::new(Mutex::new(ResolutionMap::new())),
    );
    let mut stream = encode_image_size(&Resolution::Level(0), 0, 4, 4);
    stream.extend(encode_tile(&Resolution::Level(0), 3, 0, &[0xDE, 0xAD, 0xBE, 0xEF]));
    handler.run(stream.as_slice()).await.unwrap();

    let payload = reader.join().unwrap().unwrap();
    assert_eq!(payload.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(cache.get(id), Some(Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF])));
}

#[tokio::test]
async fn test_served_pyramid_matches_local_reads() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(CodecRegistry::with_builtin());
    let pyramid = two_level_pyramid();

    // Write every block of both levels, deflate-compressed
    let file = TiledFile::create(dir.path().join("served.rpyr"), &pyramid, CodecKind::Deflate)
        .unwrap();
    let mut expected = HashMap::new();
    for (level, geometry) in pyramid.levels().iter().enumerate() {
        let mut accessor = file.accessor(level, AccessMode::WriteOnly, &registry).unwrap();
        for index in 0..geometry.block_count() {
            let (x, y) = geometry.block_origin(index).unwrap();
            let data = noise(geometry.raw_block_len(y), ((level as u32) << 8) | index as u32);
            accessor.write_block(x, y, &data).unwrap();
            expected.insert((level as u8, index), data);
        }
        accessor.close().unwrap();
    }

    // Serve the compressed packets exactly as stored
    let mut replies = HashMap::new();
    for level in 0..pyramid.level_count() {
        let mut store = file.level(level).unwrap();
        for index in 0..store.geometry().block_count() {
            let packet = store.read_packet(index).unwrap().unwrap();
            replies.insert(
                (Resolution::Level(level as u8), index),
                Reply::Tile(packet.into_bytes()),
            );
        }
    }
    let server = MockTileServer::start(replies).await;

    let cache = Arc::new(TileCache::new());
    let connection = Arc::new(
        RemoteConnection::connect(server.addr(), Arc::clone(&cache))
            .await
            .unwrap(),
    );

    // Async reads of level 0
    let level0 = RemoteBlockStore::new(
        Arc::clone(&cache),
        Arc::clone(&connection) as _,
        Arc::clone(&registry),
        *pyramid.level(0).unwrap(),
        CodecKind::Deflate,
        0,
        0,
    );
    for index in 0..4u64 {
        let (x, y) = pyramid.level(0).unwrap().block_origin(index).unwrap();
        let block = timeout(WAIT, level0.fetch_block(x, y)).await.unwrap().unwrap();
        assert_eq!(block, expected[&(0, index)], "level 0 block {index}");
    }

    // Blocking accessor reads of level 1 from a worker thread
    let level1 = RemoteBlockStore::new(
        Arc::clone(&cache),
        Arc::clone(&connection) as _,
        Arc::clone(&registry),
        *pyramid.level(1).unwrap(),
        CodecKind::Deflate,
        0,
        1,
    )
    .with_timeout(WAIT);
    let registry_for_reader = Arc::clone(&registry);
    let block = tokio::task::spawn_blocking(move || {
        let mut accessor =
            ResolutionAccessor::new(level1, &registry_for_reader, 0, 1, AccessMode::ReadOnly)
                .unwrap();
        accessor.read_block(0, 0)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(block, expected[&(1, 0)]);

    // Re-reading hits the cache instead of the server
    let requested = server.requests().len();
    let again = level0.fetch_block(2, 2).await.unwrap();
    assert_eq!(again, expected[&(0, 3)]);
    assert_eq!(server.requests().len(), requested);
    assert_eq!(requested, 5);
}
