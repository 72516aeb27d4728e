//! In-memory tile byte cache with single-flight deduplication.
//!
//! Sits in front of the disk cache and the network: when several tile tasks
//! (or several loads sharing a fetcher) want the same cache key at once,
//! only one fetch runs and the rest wait on its result over a broadcast
//! channel. Entries are raw response bytes, evicted LRU under a byte budget.

use crate::metrics::Metrics;
use bytes::Bytes;
use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// LRU cache for raw tile bytes keyed by the fetch cache key.
pub struct MemoryCache {
    /// Cached tile bytes
    cache: RwLock<LruCache<String, Bytes>>,

    /// In-flight fetches; late requesters subscribe instead of re-fetching
    in_flight: RwLock<HashMap<String, broadcast::Sender<Result<Bytes, String>>>>,

    /// Maximum cache size in bytes
    max_bytes: u64,

    /// Current cache size in bytes
    current_bytes: AtomicU64,

    metrics: Option<Arc<Metrics>>,
}

impl MemoryCache {
    /// Create a cache bounded to `max_bytes` of tile data.
    pub fn new(max_bytes: u64, metrics: Option<Arc<Metrics>>) -> Self {
        // Entry-count capacity is a coarse upper bound; the byte budget is
        // what actually drives eviction
        let estimated_tile_size: u64 = 64 * 1024;
        let capacity = ((max_bytes / estimated_tile_size) as usize).max(16);

        Self {
            cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or_else(|| NonZeroUsize::new(16).expect("16 > 0")),
            )),
            in_flight: RwLock::new(HashMap::new()),
            max_bytes,
            current_bytes: AtomicU64::new(0),
            metrics,
        }
    }

    /// Get cached bytes or run `fetch` to produce them.
    ///
    /// Single-flight: if another task is already fetching this key, the
    /// caller waits on that task's broadcast instead of fetching again.
    /// Failed fetches are not cached; the error string is relayed to all
    /// waiters.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<Bytes, String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, String>>,
    {
        // Fast path: already cached
        {
            let mut cache = self.cache.write().await;
            if let Some(bytes) = cache.get(key) {
                return Ok(bytes.clone());
            }
        }

        // Someone else fetching? Wait on their result
        {
            let in_flight = self.in_flight.read().await;
            if let Some(sender) = in_flight.get(key) {
                let mut rx = sender.subscribe();
                drop(in_flight);

                if let Some(ref m) = self.metrics {
                    m.add_coalesced();
                }

                return match rx.recv().await {
                    Ok(result) => result,
                    Err(e) => Err(format!("broadcast channel error: {}", e)),
                };
            }
        }

        // We fetch; register so later callers can wait
        let (tx, _) = broadcast::channel(16);
        {
            let mut in_flight = self.in_flight.write().await;
            in_flight.insert(key.to_string(), tx.clone());
        }

        let result = fetch().await;

        match result {
            Ok(bytes) => {
                self.evict_if_needed(bytes.len() as u64).await;
                {
                    let mut cache = self.cache.write().await;
                    if let Some((_, evicted)) = cache.push(key.to_string(), bytes.clone()) {
                        // push() may displace a different entry at capacity
                        self.current_bytes
                            .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
                    }
                    self.current_bytes
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }

                {
                    let mut in_flight = self.in_flight.write().await;
                    in_flight.remove(key);
                }
                let _ = tx.send(Ok(bytes.clone()));

                Ok(bytes)
            }
            Err(message) => {
                {
                    let mut in_flight = self.in_flight.write().await;
                    in_flight.remove(key);
                }
                let _ = tx.send(Err(message.clone()));

                Err(message)
            }
        }
    }

    /// Pop LRU entries until the new tile fits the byte budget.
    async fn evict_if_needed(&self, new_size: u64) {
        if self.current_bytes.load(Ordering::Relaxed) + new_size <= self.max_bytes {
            return;
        }

        let mut cache = self.cache.write().await;
        while self.current_bytes.load(Ordering::Relaxed) + new_size > self.max_bytes {
            match cache.pop_lru() {
                Some((_, evicted)) => {
                    self.current_bytes
                        .fetch_sub(evicted.len() as u64, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Current cached bytes.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let cache = MemoryCache::new(1024 * 1024, None);

        let first = cache
            .get_or_fetch("k1", || async { Ok(Bytes::from_static(b"tile-bytes")) })
            .await
            .unwrap();

        let second = cache
            .get_or_fetch("k1", || async { panic!("should not be called") })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_byte_budget_eviction() {
        let cache = MemoryCache::new(2000, None);

        for key in ["a", "b", "c"] {
            cache
                .get_or_fetch(key, || async { Ok(Bytes::from(vec![0u8; 800])) })
                .await
                .unwrap();
        }

        assert!(cache.current_bytes() <= 2000);
    }

    #[tokio::test]
    async fn test_single_flight_deduplication() {
        let cache = Arc::new(MemoryCache::new(1024 * 1024, None));
        let fetch_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let count = fetch_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("shared", || {
                        let count = count.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                            Ok(Bytes::from_static(b"shared-tile"))
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Racing first requesters may double-fetch; 10 identical fetches may not
        assert!(
            fetch_count.load(Ordering::SeqCst) <= 2,
            "expected single-flight to coalesce, got {} fetches",
            fetch_count.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_failed_fetch_not_cached() {
        let cache = MemoryCache::new(1024 * 1024, None);

        let result = cache
            .get_or_fetch("bad", || async { Err("HTTP 500".to_string()) })
            .await;
        assert!(result.is_err());

        let result = cache
            .get_or_fetch("bad", || async { Ok(Bytes::from_static(b"ok now")) })
            .await;
        assert!(result.is_ok());
    }
}
