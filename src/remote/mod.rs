//! Streaming tile protocol client.
//!
//! # Components
//!
//! - [`protocol`]: message grammar, resolution tokens, request lines
//! - [`ProtocolHandler`]: receive loop delivering tiles into a [`TileCache`](crate::tile::TileCache)
//! - [`RemoteConnection`]: TCP connection with a request writer and a handler task

pub mod protocol;

mod connection;
mod handler;

pub use connection::RemoteConnection;
pub use handler::{ImageSizes, ProtocolHandler, MAX_LINE_LEN, MAX_TILE_LEN};
pub use protocol::{MessageHeader, Resolution, ResolutionMap, TileRequest};
