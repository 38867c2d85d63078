use thiserror::Error;

/// Errors raised by the binary primitive codec and the block codecs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A write would run past the end of a fixed-capacity buffer
    #[error("Buffer overflow: need {needed} bytes, capacity is {capacity}")]
    BufferOverflow { needed: usize, capacity: usize },

    /// Compressed data does not parse, or its size does not match the geometry
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Caller supplied input that does not fit the configured geometry
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bit depth changed since the last `reset()`
    #[error("Codec must be reset after changing bits per pixel")]
    ResetRequired,

    /// No codec registered for this identifier
    #[error("Unknown codec: {0}")]
    UnknownCodec(u16),
}

/// Errors surfaced to waiters of a tile fetch.
///
/// Cloned once per waiter, so every variant carries owned data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The fetch was reported as failed by whoever issued it
    #[error("Tile fetch failed: {0}")]
    Failed(String),

    /// The fetch was canceled before its payload arrived
    #[error("Tile fetch canceled")]
    Canceled,

    /// The connection delivering tiles hit a fatal error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection closed while the fetch was outstanding
    #[error("Connection closed")]
    ConnectionClosed,
}

impl FetchError {
    /// Cancellation is cooperative and should not be reported to end users.
    pub fn is_canceled(&self) -> bool {
        matches!(self, FetchError::Canceled)
    }
}

/// Errors from resolution accessors and their storage backends.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Underlying file I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// The backend holds no data for the requested block
    #[error("No block at ({x}, {y})")]
    NotFound { x: u32, y: u32 },

    /// Operation not permitted by the accessor's access mode
    #[error("Access denied: {0}")]
    AccessDenied(&'static str),

    /// Operation invalid in the current state (closed accessor, out-of-order write)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Backend cannot perform this operation at all
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Block coordinates are misaligned or outside the level
    #[error("Invalid block coordinates ({x}, {y}): {reason}")]
    InvalidCoordinates { x: u32, y: u32, reason: String },

    /// Geometry parameters violate the block geometry invariants
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Block codec failure
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Remote tile fetch failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Errors in the streaming tile protocol.
///
/// Every variant is fatal to the connection: once a message is misparsed the
/// stream framing is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header line does not follow the message grammar
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Header names a message type this handler does not understand
    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    /// Unlimited-resolution token never announced by a size message
    #[error("Unknown resolution token: {0}")]
    UnknownResolution(String),

    /// Tile payload not followed by the CRLF end marker
    #[error("Missing end-of-message marker after tile {index}")]
    MissingEndMarker { index: u64 },

    /// Stream ended in the middle of a message
    #[error("Stream truncated: {0}")]
    Truncated(String),

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated(err.to_string())
        } else {
            ProtocolError::Io(err.to_string())
        }
    }
}
