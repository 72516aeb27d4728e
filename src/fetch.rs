//! Cache-aware tile fetching.
//!
//! A tile request hashes to a deterministic cache key. Fetching consults the
//! in-memory cache (optional), then the disk cache, then the network, with
//! bounded retries. Transport and HTTP failures are soft: they come back as
//! an unsuccessful [`TileResponse`], never as an error, because a failed
//! tile must not abort the surrounding load.

use crate::cache::MemoryCache;
use crate::metrics::Metrics;
use crate::service::TileRequest;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Initial delay between retry attempts; doubles each retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Filename extension for disk cache entries.
const CACHE_EXT: &str = "tile";

/// Result of fetching one tile. Failure is data, not an error.
#[derive(Debug, Clone)]
pub struct TileResponse {
    /// Whether usable bytes were obtained.
    pub success: bool,

    /// Raw response body; empty on failure.
    pub data: Bytes,

    /// Content type reported by the server (or inferred for cache hits).
    pub content_type: String,

    /// HTTP status code; 0 for transport-level failures.
    pub status_code: u16,

    /// Response headers.
    pub headers: Vec<(String, String)>,

    /// Set when `success` is false.
    pub error_message: Option<String>,
}

impl TileResponse {
    /// Successful response with the given body.
    pub fn success(data: Bytes, content_type: String, status_code: u16) -> Self {
        Self {
            success: true,
            data,
            content_type,
            status_code,
            headers: Vec::new(),
            error_message: None,
        }
    }

    /// Synthetic 200 for bytes served from a cache.
    pub fn cached(data: Bytes, content_type: &str) -> Self {
        Self::success(data, content_type.to_string(), 200)
    }

    /// Failed response carrying a descriptive message.
    pub fn failure(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Bytes::new(),
            content_type: String::new(),
            status_code,
            headers: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Identifying fields of a request, serialized in fixed order so the digest
/// does not depend on how the parameter list was assembled.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    url: &'a str,
    params: &'a [(String, String)],
    format: &'a str,
    bbox: [f64; 4],
    width: u32,
    height: u32,
}

/// Deterministic cache key for a tile request.
///
/// SHA-256 over a canonical JSON document of the identifying fields, with
/// query parameters sorted by key (then value). Two requests that differ
/// only in parameter order produce the same key.
pub fn cache_key(request: &TileRequest) -> String {
    let mut params = request.params.clone();
    params.sort();

    let canonical = CanonicalRequest {
        url: &request.url,
        params: &params,
        format: request.output_format.as_mime(),
        bbox: [
            request.bbox.min_x,
            request.bbox.min_y,
            request.bbox.max_x,
            request.bbox.max_y,
        ],
        width: request.width,
        height: request.height,
    };

    let doc = serde_json::to_vec(&canonical).expect("canonical request serialization cannot fail");
    let digest = Sha256::digest(&doc);
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Path of the disk cache entry for a key.
fn cache_path(dir: &Path, key: &str) -> PathBuf {
    dir.join(format!("{}.{}", key, CACHE_EXT))
}

/// Abstraction over tile fetching so assembly can be driven by stubs in
/// tests and by alternative transports.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    /// Fetch one tile. Must not fail: transport errors are encoded in the
    /// response.
    async fn fetch(&self, request: &TileRequest) -> TileResponse;
}

/// HTTP fetcher with optional disk and in-memory caching.
pub struct HttpFetcher {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
    memory: Option<MemoryCache>,
    metrics: Option<Arc<Metrics>>,
}

impl HttpFetcher {
    /// Create a fetcher with no caching.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .build()
                .expect("failed to create HTTP client"),
            cache_dir: None,
            memory: None,
            metrics: None,
        }
    }

    /// Serve and persist tiles under this directory (created if absent).
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Add an in-memory single-flight cache bounded to `max_bytes`.
    pub fn with_memory_cache(mut self, max_bytes: u64) -> Self {
        if max_bytes > 0 {
            self.memory = Some(MemoryCache::new(max_bytes, self.metrics.clone()));
        }
        self
    }

    /// Record fetch activity on the given metrics.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Disk-then-network fetch for one key.
    async fn fetch_uncached(&self, request: &TileRequest, key: &str) -> TileResponse {
        // Disk cache first
        if let Some(dir) = &self.cache_dir {
            let path = cache_path(dir, key);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    tracing::debug!("Cache hit for {} ({} bytes)", key, bytes.len());
                    if let Some(ref m) = self.metrics {
                        m.add_cache_hit();
                    }
                    return TileResponse::cached(
                        Bytes::from(bytes),
                        request.output_format.as_mime(),
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Failed to read cache entry {}: {}", path.display(), e);
                }
            }
        }

        if let Some(ref m) = self.metrics {
            m.add_cache_miss();
        }

        let response = self.fetch_network(request).await;

        // Persist best-effort; a failed write never fails the fetch
        if response.success {
            if let Some(dir) = &self.cache_dir {
                if let Err(e) = write_cache_entry(dir, key, &response.data).await {
                    tracing::warn!("Failed to write cache entry {}: {}", key, e);
                }
            }
        }

        response
    }

    /// Network fetch with bounded retries and exponential backoff.
    async fn fetch_network(&self, request: &TileRequest) -> TileResponse {
        let attempts = request.retries + 1;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_failure = TileResponse::failure(0, "no attempts made");

        for attempt in 1..=attempts {
            tracing::debug!(
                "Fetching tile (attempt {}/{}): {}",
                attempt,
                attempts,
                request.url
            );

            match self.try_get(request).await {
                Ok(response) if response.success => {
                    if let Some(ref m) = self.metrics {
                        m.add_tile_fetched();
                        m.add_bytes_fetched(response.data.len() as u64);
                    }
                    return response;
                }
                Ok(response) => {
                    tracing::warn!(
                        "Tile request failed (attempt {}/{}): HTTP {}",
                        attempt,
                        attempts,
                        response.status_code
                    );
                    last_failure = response;
                }
                Err(e) => {
                    tracing::warn!("Tile request failed (attempt {}/{}): {}", attempt, attempts, e);
                    last_failure = TileResponse::failure(0, format!("network error: {}", e));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        if let Some(ref m) = self.metrics {
            m.add_tile_failure();
        }
        last_failure
    }

    /// One HTTP GET attempt.
    async fn try_get(&self, request: &TileRequest) -> Result<TileResponse, reqwest::Error> {
        let mut builder = self
            .client
            .get(&request.url)
            .query(&request.params)
            .timeout(request.timeout);

        let mut has_accept = false;
        for (name, value) in &request.headers {
            has_accept = has_accept || name.eq_ignore_ascii_case("accept");
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_accept {
            builder = builder.header("Accept", request.output_format.as_mime());
        }

        let response = builder.send().await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        if status.as_u16() == 200 {
            let data = response.bytes().await?;
            Ok(TileResponse {
                success: true,
                data,
                content_type,
                status_code: 200,
                headers,
                error_message: None,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            Ok(TileResponse {
                success: false,
                data: Bytes::new(),
                content_type,
                status_code: status.as_u16(),
                headers,
                error_message: Some(format!("HTTP {}: {}", status.as_u16(), snippet)),
            })
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, request: &TileRequest) -> TileResponse {
        let key = cache_key(request);

        match &self.memory {
            Some(memory) => {
                let result = memory
                    .get_or_fetch(&key, || async {
                        let response = self.fetch_uncached(request, &key).await;
                        if response.success {
                            Ok(response.data)
                        } else {
                            Err(response
                                .error_message
                                .unwrap_or_else(|| format!("HTTP {}", response.status_code)))
                        }
                    })
                    .await;

                match result {
                    Ok(bytes) => TileResponse::cached(bytes, request.output_format.as_mime()),
                    Err(message) => TileResponse::failure(0, message),
                }
            }
            None => self.fetch_uncached(request, &key).await,
        }
    }
}

/// Write a cache entry atomically: temp file in the same directory, then
/// rename. Concurrent writers for the same key produce identical bytes, so
/// a lost rename race is benign.
async fn write_cache_entry(dir: &Path, key: &str, data: &Bytes) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!("{}.{}.tmp{}", key, CACHE_EXT, std::process::id()));
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, cache_path(dir, key)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{BoundingBox, Crs};
    use crate::service::OutputFormat;

    fn request(params: Vec<(&str, &str)>) -> TileRequest {
        TileRequest {
            url: "http://example.com/wcs".to_string(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: Vec::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
            output_format: OutputFormat::GeoTiff,
            crs: Crs::Epsg4326,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0, Crs::Epsg4326).unwrap(),
            width: 256,
            height: 256,
        }
    }

    #[test]
    fn test_cache_key_ignores_param_order() {
        let a = request(vec![("service", "WCS"), ("coverageId", "elevation")]);
        let b = request(vec![("coverageId", "elevation"), ("service", "WCS")]);
        assert_eq!(cache_key(&a), cache_key(&b));
    }

    #[test]
    fn test_cache_key_distinguishes_requests() {
        let a = request(vec![("coverageId", "elevation")]);
        let mut b = request(vec![("coverageId", "elevation")]);
        b.width = 512;
        assert_ne!(cache_key(&a), cache_key(&b));

        let mut c = request(vec![("coverageId", "elevation")]);
        c.bbox = BoundingBox::new(0.0, 0.0, 2.0, 2.0, Crs::Epsg4326).unwrap();
        assert_ne!(cache_key(&a), cache_key(&c));
    }

    #[test]
    fn test_cache_key_is_hex_digest() {
        let key = cache_key(&request(vec![]));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_disk_cache_hit_avoids_network() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(vec![("coverageId", "elevation")]);
        let key = cache_key(&req);

        // Seed the cache; the URL is unroutable so any network attempt
        // would fail rather than silently succeed
        std::fs::write(cache_path(dir.path(), &key), b"cached tile bytes").unwrap();

        let fetcher = HttpFetcher::new().with_cache_dir(dir.path());
        let response = fetcher.fetch(&req).await;

        assert!(response.success);
        assert_eq!(response.status_code, 200);
        assert_eq!(&response.data[..], b"cached tile bytes");
    }

    #[tokio::test]
    async fn test_memory_cache_layer_serves_second_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(vec![("coverageId", "elevation")]);
        let key = cache_key(&req);
        std::fs::write(cache_path(dir.path(), &key), b"bytes").unwrap();

        let fetcher = HttpFetcher::new()
            .with_cache_dir(dir.path())
            .with_memory_cache(1024 * 1024);

        let first = fetcher.fetch(&req).await;
        assert!(first.success);

        // Remove the disk entry; the memory layer must still serve it
        std::fs::remove_file(cache_path(dir.path(), &key)).unwrap();
        let second = fetcher.fetch(&req).await;
        assert!(second.success);
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn test_cache_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = Bytes::from_static(b"fresh tile");
        write_cache_entry(dir.path(), "abc123", &data).await.unwrap();

        let read_back = std::fs::read(cache_path(dir.path(), "abc123")).unwrap();
        assert_eq!(read_back, b"fresh tile");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
