//! Client connection to a tile server.
//!
//! ```text
//!   caller ──request()──▶ mpsc ──▶ writer task ──▶ socket write half
//!                                                        │
//!   TileCache ◀──deliver/fail── ProtocolHandler ◀── socket read half
//! ```
//!
//! Requests never block: they are queued for the writer task and the
//! payloads arrive later through the cache.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{FetchError, ProtocolError};
use crate::geometry::TileId;
use crate::tile::{Acquired, TileCache, TileRequester};

use super::handler::{ImageSizes, ProtocolHandler};
use super::protocol::{format_request, ResolutionMap, TileRequest};

/// An open connection feeding one tile cache.
pub struct RemoteConnection {
    cache: Arc<TileCache>,
    sizes: Arc<ImageSizes>,
    resolutions: Arc<Mutex<ResolutionMap>>,
    requests: mpsc::UnboundedSender<String>,
    reader: JoinHandle<Result<(), ProtocolError>>,
    writer: JoinHandle<()>,
    peer: Option<SocketAddr>,
}

impl RemoteConnection {
    /// Connect over TCP. Must be called inside a tokio runtime.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        cache: Arc<TileCache>,
    ) -> Result<Self, FetchError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;
        let peer = stream.peer_addr().ok();
        // Requests are small and latency-bound
        stream
            .set_nodelay(true)
            .map_err(|e| FetchError::Connection(e.to_string()))?;

        let mut connection = Self::from_stream(stream, cache);
        connection.peer = peer;
        info!(peer = ?peer, "connected to tile server");
        Ok(connection)
    }

    /// Run the protocol over any byte stream. Must be called inside a tokio runtime.
    pub fn from_stream<S>(stream: S, cache: Arc<TileCache>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_resolutions(stream, cache, ResolutionMap::new())
    }

    /// Like [`from_stream`](Self::from_stream), with a preconfigured resolution map.
    pub fn with_resolutions<S>(stream: S, cache: Arc<TileCache>, resolutions: ResolutionMap) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let sizes = Arc::new(ImageSizes::new());
        let resolutions = Arc::new(Mutex::new(resolutions));

        let handler = ProtocolHandler::new(
            Arc::clone(&cache),
            Arc::clone(&sizes),
            Arc::clone(&resolutions),
        );
        let reader = tokio::spawn(async move { handler.run(BufReader::new(read_half)).await });

        let (requests, mut queue) = mpsc::unbounded_channel::<String>();
        let writer_cache = Arc::clone(&cache);
        let writer = tokio::spawn(async move {
            while let Some(line) = queue.recv().await {
                let sent = async {
                    write_half.write_all(line.as_bytes()).await?;
                    write_half.flush().await
                }
                .await;
                if let Err(e) = sent {
                    error!(error = %e, "failed to send tile request");
                    writer_cache.fail_all(FetchError::Connection(e.to_string()));
                    break;
                }
                debug!(request = %line.trim_end(), "sent tile request");
            }
            let _ = write_half.shutdown().await;
        });

        Self {
            cache,
            sizes,
            resolutions,
            requests,
            reader,
            writer,
            peer: None,
        }
    }

    pub fn cache(&self) -> &Arc<TileCache> {
        &self.cache
    }

    pub fn sizes(&self) -> &Arc<ImageSizes> {
        &self.sizes
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// True once the receive loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.reader.is_finished()
    }

    /// Look up a tile, requesting it if this call created the Pending entry.
    pub fn acquire(&self, page: u32, id: TileId) -> Acquired {
        let acquired = self.cache.acquire_or_fetch(id);
        if acquired.is_issued() {
            if let Err(e) = self.request(page, &[id]) {
                self.cache.fail(id, e.to_string());
            }
        }
        acquired
    }

    /// Fetch one tile and wait for its payload.
    pub async fn fetch(&self, page: u32, id: TileId) -> Result<Bytes, FetchError> {
        self.acquire(page, id).wait().await
    }

    /// Issue look-ahead requests for tiles not already cached or pending.
    ///
    /// Returns how many tiles were requested. All of them go out in a
    /// single request line.
    pub fn prefetch(&self, page: u32, ids: &[TileId]) -> usize {
        let issued: Vec<TileId> = ids
            .iter()
            .copied()
            .filter(|id| self.cache.acquire_or_fetch(*id).is_issued())
            .collect();
        if issued.is_empty() {
            return 0;
        }

        if let Err(e) = self.request(page, &issued) {
            for id in &issued {
                self.cache.fail(*id, e.to_string());
            }
            return 0;
        }
        debug!(page, tiles = issued.len(), "prefetching tiles");
        issued.len()
    }

    /// Cancel pending tiles. Payloads arriving later are discarded.
    pub fn cancel(&self, ids: &[TileId]) -> usize {
        ids.iter().filter(|id| self.cache.cancel(**id)).count()
    }

    /// Stop both tasks and fail anything still pending.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
        let failed = self.cache.fail_all(FetchError::ConnectionClosed);
        debug!(pending_failed = failed, "connection shut down");
    }

    /// Wait for the server to close the stream.
    ///
    /// Returns the protocol error that ended the receive loop, if any.
    pub async fn closed(mut self) -> Result<(), ProtocolError> {
        match (&mut self.reader).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ProtocolError::Io(e.to_string())),
        }
    }
}

impl TileRequester for RemoteConnection {
    fn request(&self, page: u32, ids: &[TileId]) -> Result<(), FetchError> {
        if ids.is_empty() {
            return Ok(());
        }
        let requests: Vec<TileRequest> = {
            let map = self
                .resolutions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .map(|id| TileRequest {
                    resolution: map.resolution_for(id.level()),
                    index: id.index(),
                    page,
                })
                .collect()
        };
        self.requests
            .send(format_request(&requests))
            .map_err(|_| FetchError::ConnectionClosed)
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
