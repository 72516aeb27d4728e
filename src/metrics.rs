//! Counters for tile loading.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics for a load, shared across tile tasks.
#[derive(Debug)]
pub struct Metrics {
    /// Tiles fetched from the network.
    pub tiles_fetched: AtomicU64,

    /// Tiles that failed after exhausting retries, or failed to decode.
    pub tile_failures: AtomicU64,

    /// Tiles served from the disk cache.
    pub cache_hits: AtomicU64,

    /// Tiles that missed every cache layer.
    pub cache_misses: AtomicU64,

    /// Requests that waited on an identical in-flight fetch.
    pub coalesced: AtomicU64,

    /// Bytes received over the network.
    pub bytes_fetched: AtomicU64,

    /// Time spent decoding tiles (microseconds).
    pub decode_us: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    /// Create new shared metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tiles_fetched: AtomicU64::new(0),
            tile_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            decode_us: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    pub fn add_tile_fetched(&self) {
        self.tiles_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_tile_failure(&self) {
        self.tile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_fetched(&self, bytes: u64) {
        self.bytes_fetched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_decode_time(&self, duration: Duration) {
        self.decode_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Elapsed time since the metrics were created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tiles_fetched: self.tiles_fetched.load(Ordering::Relaxed),
            tile_failures: self.tile_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            decode_secs: self.decode_us.load(Ordering::Relaxed) as f64 / 1e6,
            elapsed_secs: self.elapsed().as_secs_f64(),
        }
    }
}

/// Serializable snapshot of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tiles_fetched: u64,
    pub tile_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub coalesced: u64,
    pub bytes_fetched: u64,
    pub decode_secs: f64,
    pub elapsed_secs: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "fetched: {}, failed: {}, cache hits: {}, misses: {}, coalesced: {}, {:.1} KB in {:.1}s",
            self.tiles_fetched,
            self.tile_failures,
            self.cache_hits,
            self.cache_misses,
            self.coalesced,
            self.bytes_fetched as f64 / 1024.0,
            self.elapsed_secs,
        )
    }
}
