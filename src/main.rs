//! raster-pyramid - inspect pyramid files and fetch tiles from a tile server.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raster_pyramid::{
    config::{Cli, Command, FetchConfig, InfoConfig},
    geometry::TileId,
    metadata::{RawMetadata, TextMetadata},
    remote::RemoteConnection,
    store::TiledFile,
    tile::TileCache,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Info(config) => run_info(config),
        Command::Fetch(config) => run_fetch(config).await,
    }
}

/// Initialize the tracing subscriber with environment filter.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "raster_pyramid=debug"
    } else {
        "raster_pyramid=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// =============================================================================
// Info Command
// =============================================================================

fn run_info(config: InfoConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let file = match TiledFile::open(&config.path) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to open {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    println!("{}", config.path.display());
    println!("═════════════════════════════════");
    for level in file.summaries() {
        let g = level.geometry;
        println!(
            "level {}: {}x{} px, {:?} {}x{}, {} bpp, {}, {}/{} blocks",
            level.level,
            g.width(),
            g.height(),
            g.layout(),
            g.block_width(),
            g.block_height(),
            g.bits_per_pixel(),
            level.codec,
            level.present,
            g.block_count()
        );
    }

    let metadata = file.metadata();
    if !metadata.is_empty() {
        println!();
        println!("metadata:");
        for record in metadata.iter() {
            let text = record
                .as_any()
                .downcast_ref::<RawMetadata>()
                .and_then(|raw| TextMetadata::from_raw(raw).ok());
            match text {
                Some(text) => println!("  tag {}: {}", record.tag(), text.text()),
                None => println!("  tag {}: {} bytes", record.tag(), record.payload().len()),
            }
        }
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Fetch Command
// =============================================================================

async fn run_fetch(config: FetchConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let cache = Arc::new(TileCache::with_capacity(config.cache_capacity));
    let connection = match RemoteConnection::connect(config.server.as_str(), cache).await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to connect to {}: {}", config.server, e);
            return ExitCode::FAILURE;
        }
    };

    let id = TileId::from_index(config.level, config.index);
    info!("Fetching tile {} (page {})", id, config.page);

    let payload = match tokio::time::timeout(config.timeout(), connection.fetch(config.page, id)).await
    {
        Ok(Ok(payload)) => payload,
        Ok(Err(e)) => {
            error!("Tile {} failed: {}", id, e);
            return ExitCode::FAILURE;
        }
        Err(_) => {
            connection.cancel(&[id]);
            error!("Tile {} not received within {}s", id, config.timeout);
            return ExitCode::FAILURE;
        }
    };
    debug!("Received {} bytes", payload.len());

    let written = match &config.output {
        Some(path) => tokio::fs::write(path, &payload).await,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&payload).and_then(|_| stdout.flush())
        }
    };
    if let Err(e) = written {
        error!("Failed to write tile: {}", e);
        return ExitCode::FAILURE;
    }

    connection.shutdown();
    info!("Wrote {} bytes", payload.len());
    ExitCode::SUCCESS
}
