//! Command-line configuration for the `raster-pyramid` binary.
//!
//! Two subcommands:
//!
//! - `info <path>`: describe a tiled pyramid file
//! - `fetch --server <addr> --level <n> --index <i>`: pull one tile from a
//!   tile server
//!
//! # Environment Variables
//!
//! Every option can also be set through an environment variable with the
//! `RASTER_` prefix:
//!
//! - `RASTER_PATH` - Pyramid file for `info`
//! - `RASTER_SERVER` - Tile server address as `host:port`
//! - `RASTER_LEVEL` - Resolution level to fetch
//! - `RASTER_INDEX` - Tile index within the level
//! - `RASTER_PAGE` - Page (sub-image) number (default: 0)
//! - `RASTER_OUTPUT` - File to write the tile payload to (default: stdout)
//! - `RASTER_TIMEOUT` - Seconds to wait for the tile (default: 30)
//! - `RASTER_CACHE_CAPACITY` - Tile cache size in bytes (default: 64MB)

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::geometry::MAX_TILE_INDEX;
use crate::tile::DEFAULT_TILE_CACHE_CAPACITY;

// =============================================================================
// Default Values
// =============================================================================

/// Default page number.
pub const DEFAULT_PAGE: u32 = 0;

/// Default seconds to wait for a tile.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Upper bound on the fetch timeout (one hour).
pub const MAX_TIMEOUT_SECS: u64 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// raster-pyramid - tiled multi-resolution raster storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "raster-pyramid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Describe the levels, codecs and metadata of a pyramid file.
    Info(InfoConfig),

    /// Fetch one tile from a tile server.
    Fetch(FetchConfig),
}

/// Options for `info`.
#[derive(Args, Debug, Clone)]
pub struct InfoConfig {
    /// Pyramid file to open.
    #[arg(env = "RASTER_PATH")]
    pub path: PathBuf,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl InfoConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.path.as_os_str().is_empty() {
            return Err("A pyramid file path is required".to_string());
        }
        Ok(())
    }
}

/// Options for `fetch`.
#[derive(Args, Debug, Clone)]
pub struct FetchConfig {
    /// Tile server address as host:port.
    #[arg(long, env = "RASTER_SERVER")]
    pub server: String,

    /// Resolution level (0 = full resolution).
    #[arg(long, env = "RASTER_LEVEL")]
    pub level: u8,

    /// Tile index in raster order within the level.
    #[arg(long, env = "RASTER_INDEX")]
    pub index: u64,

    /// Page (sub-image) number.
    #[arg(long, default_value_t = DEFAULT_PAGE, env = "RASTER_PAGE")]
    pub page: u32,

    /// Write the payload here instead of stdout.
    #[arg(short, long, env = "RASTER_OUTPUT")]
    pub output: Option<PathBuf>,

    /// Seconds to wait for the tile before giving up.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "RASTER_TIMEOUT")]
    pub timeout: u64,

    /// Tile cache capacity in bytes.
    #[arg(long, default_value_t = DEFAULT_TILE_CACHE_CAPACITY, env = "RASTER_CACHE_CAPACITY")]
    pub cache_capacity: usize,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl FetchConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.trim().is_empty() {
            return Err("Server address is required. Set --server or RASTER_SERVER".to_string());
        }
        if !self.server.contains(':') {
            return Err(format!(
                "Server address must be host:port, got '{}'",
                self.server
            ));
        }
        if self.index > MAX_TILE_INDEX {
            return Err(format!("index must be at most {MAX_TILE_INDEX}"));
        }
        if self.timeout == 0 || self.timeout > MAX_TIMEOUT_SECS {
            return Err(format!(
                "timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds"
            ));
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

// =============================================================================
// Tests
// =============================================================================
