//! Wire grammar of the streaming tile protocol.
//!
//! Server to client, ASCII headers terminated by CRLF:
//!
//! ```text
//! hip-image-size,<res>,<sub>:<width> <height>\r\n
//! hip-tile,<res>,<index>,<sub>/<length>:<length raw bytes>\r\n
//! hip-error,<class>,<code>:<message>\r\n
//! \r\n                                  (end of a response batch)
//! ```
//!
//! `<res>` is a decimal level index, or `-1=<token>` for images whose
//! resolutions are named by server-assigned tokens instead of small indices.
//!
//! Client to server, one line per batch:
//!
//! ```text
//! til=<res>,<index>,<page>&hip-til=<token>,<index>,<page>...\r\n
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::ProtocolError;

/// Terminates tile payloads, error and size bodies, and whole batches.
pub const END_MARKER: &[u8; 2] = b"\r\n";

/// Resolution field value that introduces a token.
pub const UNLIMITED_RESOLUTION: &str = "-1";

pub const IMAGE_SIZE: &str = "hip-image-size";
pub const TILE: &str = "hip-tile";
pub const ERROR: &str = "hip-error";

fn malformed(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed(msg.into())
}

fn parse_number<T: std::str::FromStr>(field: &str, what: &str) -> Result<T, ProtocolError> {
    field
        .trim()
        .parse()
        .map_err(|_| malformed(format!("invalid {what}: {field:?}")))
}

// =============================================================================
// Resolution Field
// =============================================================================

/// How a message names a resolution level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Decimal level index
    Level(u8),
    /// Server-assigned token in the unlimited resolution namespace
    Token(String),
}

impl Resolution {
    pub fn parse(field: &str) -> Result<Self, ProtocolError> {
        if let Some(rest) = field.strip_prefix(UNLIMITED_RESOLUTION) {
            if let Some(token) = rest.strip_prefix('=') {
                if token.is_empty() || token.contains([',', ':', '&']) {
                    return Err(malformed(format!("invalid resolution token: {token:?}")));
                }
                return Ok(Resolution::Token(token.to_string()));
            }
        }
        parse_number(field, "resolution").map(Resolution::Level)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Level(level) => write!(f, "{level}"),
            Resolution::Token(token) => write!(f, "{UNLIMITED_RESOLUTION}={token}"),
        }
    }
}

/// Maps resolution tokens to level indices.
///
/// Tokens are assigned consecutive levels in the order size messages first
/// announce them.
#[derive(Debug, Clone, Default)]
pub struct ResolutionMap {
    levels: HashMap<String, u8>,
    tokens: HashMap<u8, String>,
    next: u16,
}

impl ResolutionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start assigning token levels at `level` (after any fixed levels).
    pub fn starting_at(level: u8) -> Self {
        Self {
            next: level as u16,
            ..Self::default()
        }
    }

    /// Level for a resolution named by a size message, mapping new tokens.
    pub fn announce(&mut self, resolution: &Resolution) -> Result<u8, ProtocolError> {
        match resolution {
            Resolution::Level(level) => Ok(*level),
            Resolution::Token(token) => {
                if let Some(level) = self.levels.get(token) {
                    return Ok(*level);
                }
                let level = u8::try_from(self.next)
                    .map_err(|_| malformed("more than 256 resolution tokens"))?;
                self.next += 1;
                self.levels.insert(token.clone(), level);
                self.tokens.insert(level, token.clone());
                Ok(level)
            }
        }
    }

    /// Level for a resolution named by a tile message; tokens must be known.
    pub fn resolve(&self, resolution: &Resolution) -> Result<u8, ProtocolError> {
        match resolution {
            Resolution::Level(level) => Ok(*level),
            Resolution::Token(token) => self
                .levels
                .get(token)
                .copied()
                .ok_or_else(|| ProtocolError::UnknownResolution(token.clone())),
        }
    }

    /// How requests should name `level`.
    pub fn resolution_for(&self, level: u8) -> Resolution {
        match self.tokens.get(&level) {
            Some(token) => Resolution::Token(token.clone()),
            None => Resolution::Level(level),
        }
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

// =============================================================================
// Message Headers
// =============================================================================

/// Parsed text of a message header, up to (not including) the `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageHeader {
    ImageSize {
        resolution: Resolution,
        sub_image: u32,
    },
    Tile {
        resolution: Resolution,
        index: u64,
        sub_image: u32,
        length: usize,
    },
    Error {
        class: u32,
        code: u32,
    },
}

impl MessageHeader {
    pub fn parse(header: &str) -> Result<Self, ProtocolError> {
        let mut fields = header.split(',');
        let name = fields.next().unwrap_or_default();
        let fields: Vec<&str> = fields.collect();

        let expect = |count: usize| {
            if fields.len() == count {
                Ok(())
            } else {
                Err(malformed(format!(
                    "{name} needs {count} fields, got {}: {header:?}",
                    fields.len()
                )))
            }
        };

        match name {
            IMAGE_SIZE => {
                expect(2)?;
                Ok(MessageHeader::ImageSize {
                    resolution: Resolution::parse(fields[0])?,
                    sub_image: parse_number(fields[1], "sub-image")?,
                })
            }
            TILE => {
                expect(3)?;
                let (sub_image, length) = fields[2]
                    .split_once('/')
                    .ok_or_else(|| malformed(format!("tile header without length: {header:?}")))?;
                Ok(MessageHeader::Tile {
                    resolution: Resolution::parse(fields[0])?,
                    index: parse_number(fields[1], "tile index")?,
                    sub_image: parse_number(sub_image, "sub-image")?,
                    length: parse_number(length, "tile length")?,
                })
            }
            ERROR => {
                expect(2)?;
                Ok(MessageHeader::Error {
                    class: parse_number(fields[0], "error class")?,
                    code: parse_number(fields[1], "error code")?,
                })
            }
            other => Err(ProtocolError::UnknownMessage(other.to_string())),
        }
    }
}

/// Parse the `<width> <height>` body of a size message.
pub fn parse_dimensions(body: &str) -> Result<(u32, u32), ProtocolError> {
    let mut parts = body.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(width), Some(height), None) => Ok((
            parse_number(width, "width")?,
            parse_number(height, "height")?,
        )),
        _ => Err(malformed(format!("invalid image size: {body:?}"))),
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One tile named in a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    pub resolution: Resolution,
    pub index: u64,
    pub page: u32,
}

impl TileRequest {
    fn write(&self, out: &mut String) {
        use std::fmt::Write;
        // Writing to a String cannot fail
        let _ = match &self.resolution {
            Resolution::Level(level) => write!(out, "til={level},{},{}", self.index, self.page),
            Resolution::Token(token) => {
                write!(out, "hip-til={token},{},{}", self.index, self.page)
            }
        };
    }
}

/// Format one request line, CRLF included.
pub fn format_request(requests: &[TileRequest]) -> String {
    let mut line = String::new();
    for (i, request) in requests.iter().enumerate() {
        if i > 0 {
            line.push('&');
        }
        request.write(&mut line);
    }
    line.push_str("\r\n");
    line
}

/// Parse a request line (with or without its CRLF).
pub fn parse_request(line: &str) -> Result<Vec<TileRequest>, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Ok(Vec::new());
    }

    line.split('&')
        .map(|item| {
            let (command, args) = item
                .split_once('=')
                .ok_or_else(|| malformed(format!("invalid request item: {item:?}")))?;
            let args: Vec<&str> = args.split(',').collect();
            if args.len() != 3 {
                return Err(malformed(format!("request needs 3 arguments: {item:?}")));
            }
            let resolution = match command {
                "til" => Resolution::Level(parse_number(args[0], "resolution")?),
                "hip-til" => Resolution::Token(args[0].to_string()),
                other => return Err(ProtocolError::UnknownMessage(other.to_string())),
            };
            Ok(TileRequest {
                resolution,
                index: parse_number(args[1], "tile index")?,
                page: parse_number(args[2], "page")?,
            })
        })
        .collect()
}

// =============================================================================
// Server-Side Encoding
// =============================================================================

/// Encode a size message.
pub fn encode_image_size(resolution: &Resolution, sub_image: u32, width: u32, height: u32) -> Vec<u8> {
    format!("{IMAGE_SIZE},{resolution},{sub_image}:{width} {height}\r\n").into_bytes()
}

/// Encode a tile message with its payload and end marker.
pub fn encode_tile(resolution: &Resolution, index: u64, sub_image: u32, payload: &[u8]) -> Vec<u8> {
    let mut out =
        format!("{TILE},{resolution},{index},{sub_image}/{}:", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(END_MARKER);
    out
}

/// Encode an error message.
pub fn encode_error(class: u32, code: u32, message: &str) -> Vec<u8> {
    format!("{ERROR},{class},{code}:{message}\r\n").into_bytes()
}
