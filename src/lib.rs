//! tilearray
//!
//! Load rectangular regions from OGC tile services (WCS, WMS, WMTS) into
//! lazily evaluated, chunked 2-D arrays with geographic coordinate axes.
//!
//! # Architecture
//!
//! - **Grid**: Partition a bounding box into tile geometries
//! - **Service**: Turn tile geometries into protocol-specific HTTP requests
//! - **Fetch**: Cache-aware tile fetching with retries and soft failure
//! - **Decode**: Format-keyed decoders plus block-mean downsampling
//! - **Assemble**: Canonical ordering, lazy task graph, bounded-concurrency
//!   materialization with NaN fill for failed tiles
//!
//! # Usage
//!
//! ```no_run
//! use tilearray::{load_array, LoadConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoadConfig::from_file(&"config.yaml".into())?;
//!     let array = load_array(&config)?;          // lazy: no I/O yet
//!     let loaded = array.compute().await?;       // fetch, decode, assemble
//!     println!("loaded {:?}", loaded.shape());
//!     Ok(())
//! }
//! ```

pub mod assemble;
pub mod cache;
pub mod config;
pub mod decode;
pub mod error;
pub mod fetch;
pub mod geo;
pub mod grid;
pub mod metrics;
pub mod service;

#[cfg(test)]
mod integration_tests;

pub use assemble::{ArrayAttrs, Assembler, LoadedArray, TileArray};
pub use config::{FetchConfig, GridConfig, LoadConfig, ServiceConfig};
pub use decode::{downsample_mean, DecoderRegistry};
pub use error::{Error, Result};
pub use fetch::{cache_key, HttpFetcher, TileFetcher, TileResponse};
pub use geo::{BoundingBox, Crs};
pub use grid::{plan_tiles, GridSpec, TileGeometry};
pub use metrics::{Metrics, MetricsSnapshot};
pub use service::{
    OutputFormat, RequestOptions, ServiceAdapter, ServiceKind, TileRequest, WcsClient,
};

use std::sync::Arc;

/// Build the lazy array described by a configuration.
///
/// Plans the tile grid, builds one request per tile, and assembles the task
/// graph. Every configuration and structural error surfaces here; no network
/// or disk I/O happens until [`TileArray::compute`] is called on the result.
pub fn load_array(config: &LoadConfig) -> Result<TileArray> {
    config.validate()?;
    let bbox = config.bounding_box()?;
    build_array(config, bbox)
}

/// Like [`load_array`] but with an explicitly supplied bounding box.
pub fn build_array(config: &LoadConfig, bbox: BoundingBox) -> Result<TileArray> {
    let adapter = config.service.build_adapter()?;
    let spec = config.grid.spec()?;

    let tiles = grid::plan_tiles(&bbox, config.grid.chunk_pixels(), &spec)?;
    let shape = grid::grid_shape(&tiles)?;
    tracing::info!(
        "Planned {} tiles ({}x{} grid) over {}",
        tiles.len(),
        shape.0,
        shape.1,
        bbox
    );

    let options = config.request_options();
    let requests = tiles
        .iter()
        .map(|tile| adapter.build_tile_request(tile, &options))
        .collect::<Result<Vec<_>>>()?;

    let metrics = Metrics::new();
    let mut fetcher = HttpFetcher::new().with_metrics(metrics.clone());
    if let Some(dir) = &config.fetch.cache_dir {
        fetcher = fetcher.with_cache_dir(dir);
    }
    fetcher = fetcher.with_memory_cache(config.fetch.memory_cache_mb * 1024 * 1024);

    let output_format = requests.first().map(|r| r.output_format);
    let attrs = ArrayAttrs {
        crs: config.service.crs,
        service_url: adapter.base_url().to_string(),
        service_type: adapter.kind(),
        output_format,
        coverage_id: adapter.coverage_id().map(str::to_string),
    };

    Assembler::new(Arc::new(fetcher), Arc::new(DecoderRegistry::default()))
        .with_concurrency(config.fetch.concurrency)
        .with_metrics(metrics)
        .with_load_timeout(config.fetch.load_timeout())
        .assemble(requests, shape, attrs)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
