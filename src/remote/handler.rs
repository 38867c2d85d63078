//! Receive loop for the streaming tile protocol.
//!
//! The handler owns nothing but `Arc`s: tiles go into the [`TileCache`]
//! through `deliver`/`fail`, sizes into [`ImageSizes`], and resolution
//! tokens into the shared [`ResolutionMap`].
//!
//! Any framing error is fatal. Once a header or payload is misparsed the
//! position of the next message is unknown, so the loop stops and every
//! pending tile is failed with one terminal error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, error, trace, warn};

use crate::error::{FetchError, ProtocolError};
use crate::geometry::TileId;
use crate::tile::TileCache;

use super::protocol::{parse_dimensions, MessageHeader, ResolutionMap, END_MARKER};

/// Longest header or text body accepted before the stream is declared malformed.
pub const MAX_LINE_LEN: u64 = 4096;

/// Largest tile payload accepted.
pub const MAX_TILE_LEN: usize = 64 * 1024 * 1024;

/// Image dimensions announced by the server, per (level, sub-image).
#[derive(Debug, Default)]
pub struct ImageSizes {
    sizes: Mutex<HashMap<(u8, u32), (u32, u32)>>,
}

impl ImageSizes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u8, u32), (u32, u32)>> {
        self.sizes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, level: u8, sub_image: u32, width: u32, height: u32) {
        self.lock().insert((level, sub_image), (width, height));
    }

    /// `(width, height)` of a level, if announced.
    pub fn get(&self, level: u8, sub_image: u32) -> Option<(u32, u32)> {
        self.lock().get(&(level, sub_image)).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// What one call to `next_message` consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Message,
    Eof,
}

/// Parses server messages and feeds a tile cache.
#[derive(Clone)]
pub struct ProtocolHandler {
    cache: Arc<TileCache>,
    sizes: Arc<ImageSizes>,
    resolutions: Arc<Mutex<ResolutionMap>>,
}

impl ProtocolHandler {
    pub fn new(
        cache: Arc<TileCache>,
        sizes: Arc<ImageSizes>,
        resolutions: Arc<Mutex<ResolutionMap>>,
    ) -> Self {
        Self {
            cache,
            sizes,
            resolutions,
        }
    }

    fn resolutions(&self) -> MutexGuard<'_, ResolutionMap> {
        self.resolutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Process messages until the stream ends or breaks.
    ///
    /// A clean end of stream between messages fails pending tiles with
    /// [`FetchError::ConnectionClosed`] and returns `Ok`. A protocol error
    /// fails them with [`FetchError::Connection`] and is returned.
    pub async fn run<R>(&self, mut reader: R) -> Result<(), ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            match self.next_message(&mut reader).await {
                Ok(Step::Message) => {}
                Ok(Step::Eof) => {
                    let failed = self.cache.fail_all(FetchError::ConnectionClosed);
                    debug!(pending_failed = failed, "tile stream closed");
                    return Ok(());
                }
                Err(e) => {
                    let failed = self.cache.fail_all(FetchError::Connection(e.to_string()));
                    error!(error = %e, pending_failed = failed, "tile stream aborted");
                    return Err(e);
                }
            }
        }
    }

    async fn next_message<R>(&self, reader: &mut R) -> Result<Step, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(Step::Eof);
        }

        if available[0] == b'\r' {
            let mut marker = [0u8; 2];
            reader.read_exact(&mut marker).await?;
            if &marker != END_MARKER {
                return Err(ProtocolError::Malformed("stray carriage return".into()));
            }
            trace!("end of batch");
            return Ok(Step::Message);
        }

        let header = read_until(reader, b':', "message header").await?;
        match MessageHeader::parse(&header)? {
            MessageHeader::ImageSize {
                resolution,
                sub_image,
            } => {
                let body = read_line(reader).await?;
                let (width, height) = parse_dimensions(&body)?;
                let level = self.resolutions().announce(&resolution)?;
                self.sizes.set(level, sub_image, width, height);
                debug!(%resolution, level, sub_image, width, height, "image size");
            }
            MessageHeader::Tile {
                resolution,
                index,
                sub_image,
                length,
            } => {
                let level = self.resolutions().resolve(&resolution)?;
                let id = TileId::try_from_index(level, index).ok_or_else(|| {
                    ProtocolError::Malformed(format!("tile index {index} out of range"))
                })?;
                if length > MAX_TILE_LEN {
                    return Err(ProtocolError::Malformed(format!(
                        "tile {index} claims {length} bytes"
                    )));
                }

                let mut payload = vec![0u8; length];
                reader.read_exact(&mut payload).await?;
                let mut marker = [0u8; 2];
                match reader.read_exact(&mut marker).await {
                    Ok(_) if &marker == END_MARKER => {}
                    _ => return Err(ProtocolError::MissingEndMarker { index }),
                }

                if self.cache.deliver(id, Bytes::from(payload)) {
                    debug!(tile = %id, sub_image, bytes = length, "tile delivered");
                } else {
                    warn!(tile = %id, bytes = length, "discarding tile nobody is waiting for");
                }
            }
            MessageHeader::Error { class, code } => {
                let message = read_line(reader).await?;
                let failed = self.cache.fail_all(FetchError::Failed(format!(
                    "server error {class}/{code}: {message}"
                )));
                warn!(class, code, %message, pending_failed = failed, "server error");
            }
        }
        Ok(Step::Message)
    }
}

/// Read up to and excluding `delimiter`, bounded by [`MAX_LINE_LEN`].
async fn read_until<R>(reader: &mut R, delimiter: u8, what: &str) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_until(delimiter, &mut buf)
        .await?;

    if buf.last() != Some(&delimiter) {
        return Err(if buf.len() as u64 >= MAX_LINE_LEN {
            ProtocolError::Malformed(format!("{what} longer than {MAX_LINE_LEN} bytes"))
        } else {
            ProtocolError::Truncated(format!("stream ended inside {what}"))
        });
    }
    buf.pop();
    String::from_utf8(buf).map_err(|_| ProtocolError::Malformed(format!("{what} is not UTF-8")))
}

/// Read a CRLF-terminated body, returning it without the CRLF.
async fn read_line<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = read_until(reader, b'\n', "message body").await?;
    if line.pop() != Some('\r') {
        return Err(ProtocolError::Malformed(
            "message body not terminated by CRLF".into(),
        ));
    }
    Ok(line)
}
