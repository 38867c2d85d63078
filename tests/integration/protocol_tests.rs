//! Streaming protocol tests against a TCP tile server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use raster_pyramid::remote::protocol::{encode_image_size, encode_tile, Resolution, TileRequest};
use raster_pyramid::{FetchError, ProtocolError, RemoteConnection, TileCache, TileId, TileState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use super::test_utils::{MockTileServer, Reply};

const WAIT: Duration = Duration::from_secs(5);

fn tile(level: u8, index: u64, payload: &'static [u8]) -> ((Resolution, u64), Reply) {
    (
        (Resolution::Level(level), index),
        Reply::Tile(Bytes::from_static(payload)),
    )
}

#[tokio::test]
async fn test_fetch_over_tcp() {
    let server = MockTileServer::start(HashMap::from([
        tile(0, 3, b"\x01\x02\x03\x04"),
        tile(1, 0, b"level one"),
    ]))
    .await;
    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(server.addr(), Arc::clone(&cache))
        .await
        .unwrap();
    assert_eq!(connection.peer(), Some(server.addr()));

    let payload = timeout(WAIT, connection.fetch(0, TileId::from_index(0, 3)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.as_ref(), b"\x01\x02\x03\x04");

    let payload = timeout(WAIT, connection.fetch(2, TileId::from_index(1, 0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.as_ref(), b"level one");

    // Served from the cache the second time
    let again = connection.fetch(0, TileId::from_index(0, 3)).await.unwrap();
    assert_eq!(again.as_ref(), b"\x01\x02\x03\x04");
    assert_eq!(cache.stats().hits, 1);

    assert_eq!(
        server.requests(),
        vec![
            TileRequest {
                resolution: Resolution::Level(0),
                index: 3,
                page: 0
            },
            TileRequest {
                resolution: Resolution::Level(1),
                index: 0,
                page: 2
            },
        ]
    );
}

#[tokio::test]
async fn test_payload_containing_delimiters() {
    let server = MockTileServer::start(HashMap::from([tile(0, 0, b"a:b\r\nc\r\n:")])).await;
    let connection = RemoteConnection::connect(server.addr(), Arc::new(TileCache::new()))
        .await
        .unwrap();

    let payload = timeout(WAIT, connection.fetch(0, TileId::from_index(0, 0)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.as_ref(), b"a:b\r\nc\r\n:");
}

#[tokio::test]
async fn test_prefetch_sends_one_line() {
    let server = MockTileServer::start(HashMap::from([
        tile(0, 0, b"t0"),
        tile(0, 1, b"t1"),
        tile(0, 2, b"t2"),
    ]))
    .await;
    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(server.addr(), Arc::clone(&cache))
        .await
        .unwrap();

    let ids: Vec<TileId> = (0..3).map(|i| TileId::from_index(0, i)).collect();
    assert_eq!(connection.prefetch(0, &ids), 3);
    // Already pending, nothing new to ask for
    assert_eq!(connection.prefetch(0, &ids), 0);

    for (i, id) in ids.iter().enumerate() {
        let payload = timeout(WAIT, connection.fetch(0, *id)).await.unwrap().unwrap();
        assert_eq!(payload.as_ref(), format!("t{i}").as_bytes());
    }
    assert_eq!(server.requests().len(), 3);
    assert_eq!(cache.stats().misses, 3);
}

#[tokio::test]
async fn test_server_error_fails_pending_tiles() {
    let server = MockTileServer::start(HashMap::from([(
        (Resolution::Level(0), 9),
        Reply::Error {
            class: 3,
            code: 2,
            message: "tile not available".to_string(),
        },
    )]))
    .await;
    let connection = RemoteConnection::connect(server.addr(), Arc::new(TileCache::new()))
        .await
        .unwrap();

    let err = timeout(WAIT, connection.fetch(0, TileId::from_index(0, 9)))
        .await
        .unwrap()
        .unwrap_err();
    match err {
        FetchError::Failed(message) => assert!(message.contains("tile not available")),
        other => panic!("expected Failed, got {other:?}"),
    }
    // The connection survives a server error
    assert!(!connection.is_closed());
}

#[tokio::test]
async fn test_malformed_reply_fails_pending_and_ends_loop() {
    let server = MockTileServer::start(HashMap::from([(
        (Resolution::Level(0), 1),
        Reply::Raw(b"hip-tile,0,1,0/4:abcdXX".to_vec()),
    )]))
    .await;
    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(server.addr(), Arc::clone(&cache))
        .await
        .unwrap();

    let err = timeout(WAIT, connection.fetch(0, TileId::from_index(0, 1)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, FetchError::Connection(_)), "{err:?}");

    let result = timeout(WAIT, connection.closed()).await.unwrap();
    assert!(matches!(
        result,
        Err(ProtocolError::MissingEndMarker { index: 1 })
    ));
}

#[tokio::test]
async fn test_tokens_map_to_levels() {
    // Hand-driven server: announce two tokens, then answer a token request
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut hello = encode_image_size(&Resolution::Token("a7".into()), 0, 512, 256);
        hello.extend(encode_image_size(&Resolution::Token("b2".into()), 0, 256, 128));
        hello.extend_from_slice(b"\r\n");
        socket.write_all(&hello).await.unwrap();

        let mut request = vec![0u8; 64];
        let n = socket.read(&mut request).await.unwrap();
        let line = String::from_utf8_lossy(&request[..n]).to_string();
        socket
            .write_all(&encode_tile(&Resolution::Token("b2".into()), 5, 0, b"tok"))
            .await
            .unwrap();
        line
    });

    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(addr, Arc::clone(&cache))
        .await
        .unwrap();

    // Wait for the size messages to be processed
    let sizes = Arc::clone(connection.sizes());
    timeout(WAIT, async {
        while sizes.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(sizes.get(0, 0), Some((512, 256)));
    assert_eq!(sizes.get(1, 0), Some((256, 128)));

    let payload = timeout(WAIT, connection.fetch(0, TileId::from_index(1, 5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload.as_ref(), b"tok");
    assert_eq!(server.await.unwrap(), "hip-til=b2,5,0\r\n");
}

#[tokio::test]
async fn test_server_hangup_fails_pending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 64];
        let _ = socket.read(&mut request).await;
        // Close without answering
    });

    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(addr, Arc::clone(&cache))
        .await
        .unwrap();
    let id = TileId::from_index(0, 0);
    let err = timeout(WAIT, connection.fetch(0, id))
        .await
        .unwrap()
        .unwrap_err();
    assert!(
        matches!(err, FetchError::ConnectionClosed | FetchError::Connection(_)),
        "{err:?}"
    );
    assert_eq!(cache.state(id), TileState::Empty);
    server.await.unwrap();
}

#[tokio::test]
async fn test_cancel_then_late_delivery() {
    // Server holds the tile until told to release it
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release, released) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 64];
        socket.read(&mut request).await.unwrap();
        released.await.unwrap();
        socket
            .write_all(&encode_tile(&Resolution::Level(0), 4, 0, b"late"))
            .await
            .unwrap();
        socket.write_all(b"\r\n").await.unwrap();
        socket
    });

    let cache = Arc::new(TileCache::new());
    let connection = RemoteConnection::connect(addr, Arc::clone(&cache))
        .await
        .unwrap();
    let id = TileId::from_index(0, 4);
    let acquired = connection.acquire(0, id);
    assert!(acquired.is_issued());

    assert_eq!(connection.cancel(&[id]), 1);
    assert!(acquired.wait().await.unwrap_err().is_canceled());

    release.send(()).unwrap();
    let _socket = server.await.unwrap();
    timeout(WAIT, async {
        while cache.stats().discarded == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(cache.state(id), TileState::Empty);
    assert!(cache.get(id).is_none());
}
