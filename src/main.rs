//! tilearray CLI
//!
//! Load OGC tile services into assembled 2-D arrays.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tilearray::{build_runtime, load_array, plan_tiles, LoadConfig};

#[derive(Parser)]
#[command(name = "tilearray")]
#[command(about = "Load OGC tile services into chunked 2-D arrays", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override fetch concurrency
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and assemble the configured area (default if no command specified)
    Load,

    /// Show the planned tile grid without any network activity
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Load) => load_command(cli.config, cli.concurrency)?,
        Some(Commands::Plan) => plan_command(cli.config)?,
        Some(Commands::Validate) => validate_command(cli.config)?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
    }

    Ok(())
}

fn load_command(config_path: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let mut config = LoadConfig::from_file(&config_path)?;

    if let Some(c) = concurrency {
        config.fetch.concurrency = c;
    }

    config.validate()?;

    let runtime = build_runtime(None)?;
    runtime.block_on(async {
        let array = load_array(&config)?;
        tracing::info!(
            "Assembled lazy array: {:?} pixels, {} tiles",
            array.shape(),
            array.num_tiles()
        );

        let loaded = array.compute().await?;

        let (height, width) = loaded.shape();
        let nan_count = loaded.nan_count();
        println!("\n=== Load Summary ===");
        println!("Shape: {}x{} ({} px)", height, width, height * width);
        println!("CRS: {}", loaded.attrs.crs);
        println!("Service: {} ({})", loaded.attrs.service_url, loaded.attrs.service_type);
        if let Some(coverage) = &loaded.attrs.coverage_id {
            println!("Coverage: {}", coverage);
        }
        println!(
            "x: [{:.6}, {:.6}]  y: [{:.6}, {:.6}]",
            loaded.x[0],
            loaded.x[loaded.x.len() - 1],
            loaded.y[0],
            loaded.y[loaded.y.len() - 1]
        );
        match (loaded.min(), loaded.max()) {
            (Some(min), Some(max)) => println!("Values: [{}, {}]", min, max),
            _ => println!("Values: all NaN"),
        }
        println!(
            "NaN cells: {} ({:.1}%)",
            nan_count,
            nan_count as f64 / (height * width) as f64 * 100.0
        );

        if let Some(metrics) = array.metrics() {
            println!("Fetch stats: {}", metrics.snapshot());
        }
        println!("====================\n");

        anyhow::Ok(())
    })?;

    Ok(())
}

fn plan_command(config_path: PathBuf) -> Result<()> {
    let config = LoadConfig::from_file(&config_path)?;
    config.validate()?;

    let bbox = config.bounding_box()?;
    let spec = config.grid.spec()?;
    let tiles = plan_tiles(&bbox, config.grid.chunk_pixels(), &spec)?;
    let shape = tilearray::grid::grid_shape(&tiles)?;

    println!("\n=== Tile Plan ===");
    println!("Area: {}", bbox);
    println!("Grid: {} rows x {} cols = {} tiles", shape.0, shape.1, tiles.len());

    let total_pixels: u64 = tiles
        .iter()
        .map(|t| t.width as u64 * t.height as u64)
        .sum();
    println!("Total pixels: {}", total_pixels);
    println!(
        "Estimated size: {:.1} MB (f32, uncompressed)",
        total_pixels as f64 * 4.0 / (1024.0 * 1024.0)
    );

    for (i, tile) in tiles.iter().enumerate().take(8) {
        println!("  tile {}: {} @ {}x{} px", i, tile.bbox, tile.width, tile.height);
    }
    if tiles.len() > 8 {
        println!("  ... {} more", tiles.len() - 8);
    }
    println!("=================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = LoadConfig::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# tilearray configuration

# === SERVICE: which endpoint to load tiles from ===
service:
  # Endpoint URL. The protocol is detected from the URL when `kind` is
  # omitted (looks for wcs/wms/wmts in the path or a service= parameter).
  url: "https://example.com/geoserver/wcs"

  # Protocol: WCS, WMS, or WMTS
  kind: WCS

  # Coverage identifier (required for WCS)
  coverage_id: "elevation"

  # Layer name(s) (required for WMS/WMTS)
  # layers: "satellite"

  # Tile matrix set (required for WMTS)
  # tile_matrix_set: "WorldCRS84Quad"

  # Wire format: image/tiff, image/png, application/octet-stream
  output_format: "image/tiff"

  # CRS for the request bounds and subsetting
  crs: "EPSG:4326"

  # Extra query parameters merged into every request (override defaults)
  # params:
  #   interpolation: "nearest"

# Area of interest [min_x, min_y, max_x, max_y] in the service CRS
bbox: [-1.0, 50.0, -0.5, 50.5]

# === GRID: how to partition the area into tiles ===
grid:
  # Pixels requested per tile
  chunk_width: 256
  chunk_height: 256

  # Option 1: explicit partition (uniform pixel size per cell)
  rows: 2
  cols: 2

  # Option 2: target ground resolution in CRS units per pixel
  # (mutually exclusive with rows/cols; trailing cells shrink to keep
  # units-per-pixel constant)
  # resolution: [0.001, 0.001]

# === FETCH: transport and caching ===
fetch:
  # Per-request timeout in seconds
  timeout_secs: 30

  # Retry attempts after the first failure
  retries: 3

  # Tiles fetched/decoded concurrently
  concurrency: 8

  # On-disk tile cache (created if absent); omit to disable
  # cache_dir: "/tmp/tilearray-cache"

  # In-memory tile cache budget in MB; 0 disables
  memory_cache_mb: 64

  # Abort the whole load after this many seconds; omit for no bound
  # load_timeout_secs: 600
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
