//! Read-through cache of issued signed URLs.
//!
//! The cache is strictly an optimization.  [`UrlCache::lookup`] answers
//! within a short budget and degrades every failure to a miss;
//! [`UrlCache::store`] runs on a detached task so the response never waits
//! for a cache write.
//!
//! Wire layout (hash per key, compatible with existing deployments):
//!
//! ```text
//! key:   "<bucket alias>:<object path>"
//! url:   signed URL
//! exp:   absolute expiry, decimal Unix seconds
//! TTL:   set on the whole key, same horizon as `exp`
//! ```

pub mod memory;
pub mod redis_store;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use self::redis_store::RedisCacheStore;
use crate::config::CacheConfig;
use crate::errors::{panic_message, CacheError};
use crate::metrics::{CACHE_LOOKUPS_TOTAL, CACHE_WRITES_TOTAL};

/// Boxed future returned by [`CacheStore`] methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Raw fields stored under one key.  Both are `None` for a missing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFields {
    pub url: Option<String>,
    pub exp: Option<String>,
}

/// External key-value store with hash-per-key semantics.
pub trait CacheStore: Send + Sync + 'static {
    /// Read the `url` and `exp` fields of `key`.
    fn fetch(&self, key: &str) -> CacheFuture<'_, CacheFields>;

    /// Overwrite `url` and `exp` of `key`, then expire the key after `ttl`.
    fn put(&self, key: &str, url: &str, expires_at: i64, ttl: Duration) -> CacheFuture<'_, ()>;

    /// Remove `key`.
    fn delete(&self, key: &str) -> CacheFuture<'_, ()>;
}

/// Cache key of one `(bucket alias, object path)` pair.
///
/// Bucket aliases never contain `:`, so the first `:` always separates the
/// two parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(bucket_alias: &str, object_path: &str) -> Self {
        Self(format!("{bucket_alias}:{object_path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An unexpired cached URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedUrl {
    pub url: String,
    pub seconds_remaining: u64,
}

/// Current time as Unix seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Connect the Redis URL cache described by `config`.
///
/// Returns `None` when no cache is configured or when the server cannot be
/// reached (connect + `PING`) within `connect_timeout_ms`.  The gateway then
/// runs without a cache; only latency is affected.
pub async fn connect_url_cache(config: &CacheConfig, write_timeout: Duration) -> Option<UrlCache> {
    let Some(url) = config.redis_url.as_deref() else {
        info!("No URL cache configured; every request resolves");
        return None;
    };

    let timeout = Duration::from_millis(config.connect_timeout_ms);
    match RedisCacheStore::connect(url, timeout).await {
        Ok(store) => Some(UrlCache::new(Arc::new(store), write_timeout)),
        Err(e) => {
            warn!("URL cache unavailable, continuing without it: {}", e);
            None
        }
    }
}

/// Signed URL cache over a [`CacheStore`].
#[derive(Clone)]
pub struct UrlCache {
    store: Arc<dyn CacheStore>,
    /// Timeout of detached writes and deletes.
    write_timeout: Duration,
}

impl UrlCache {
    pub fn new(store: Arc<dyn CacheStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }

    /// Return the cached URL for `key` if present and unexpired.
    ///
    /// Timeouts, store errors, missing fields and expired entries are all
    /// misses.  An entry with an unparsable expiry is also a miss and is
    /// deleted in the background.
    pub async fn lookup(&self, key: &CacheKey, budget: Duration) -> Option<CachedUrl> {
        let fields = match tokio::time::timeout(budget, self.store.fetch(key.as_str())).await {
            Ok(Ok(fields)) => fields,
            Ok(Err(e)) => {
                warn!("Cache lookup failed for key {}: {}", key, e);
                counter!(CACHE_LOOKUPS_TOTAL, "result" => "error").increment(1);
                return None;
            }
            Err(_) => {
                warn!(
                    "Cache lookup for key {}: {}",
                    key,
                    CacheError::TimedOut(budget)
                );
                counter!(CACHE_LOOKUPS_TOTAL, "result" => "error").increment(1);
                return None;
            }
        };

        let (Some(url), Some(raw_exp)) = (fields.url, fields.exp) else {
            counter!(CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
            return None;
        };
        if url.is_empty() {
            counter!(CACHE_LOOKUPS_TOTAL, "result" => "miss").increment(1);
            return None;
        }

        let expires_at = match raw_exp.trim().parse::<i64>() {
            Ok(exp) => exp,
            Err(_) => {
                let err = CacheError::CorruptExpiry {
                    key: key.to_string(),
                    raw: raw_exp,
                };
                warn!("{}; scheduling deletion", err);
                counter!(CACHE_LOOKUPS_TOTAL, "result" => "corrupt").increment(1);
                self.delete(key.clone());
                return None;
            }
        };

        let remaining = expires_at - unix_now();
        if remaining <= 0 {
            counter!(CACHE_LOOKUPS_TOTAL, "result" => "expired").increment(1);
            return None;
        }

        counter!(CACHE_LOOKUPS_TOTAL, "result" => "hit").increment(1);
        Some(CachedUrl {
            url,
            seconds_remaining: remaining as u64,
        })
    }

    /// Record `url` under `key` for `ttl` on a detached task.
    ///
    /// Failures are logged only.  The handle is returned so callers that
    /// care (tests, shutdown) can wait for the write.
    pub fn store(&self, key: CacheKey, url: String, ttl: Duration) -> JoinHandle<()> {
        let store = self.store.clone();
        let expires_at = unix_now() + ttl.as_secs() as i64;
        self.run_detached("store", key.clone(), async move {
            store.put(key.as_str(), &url, expires_at, ttl).await
        })
    }

    /// Remove `key` on a detached task.
    pub fn delete(&self, key: CacheKey) -> JoinHandle<()> {
        let store = self.store.clone();
        self.run_detached("delete", key.clone(), async move {
            store.delete(key.as_str()).await
        })
    }

    /// Spawn `op` bounded by the write timeout, converting timeouts, errors
    /// and panics into logged cache failures.
    fn run_detached<F>(&self, op: &'static str, key: CacheKey, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let timeout = self.write_timeout;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(tokio::time::timeout(timeout, fut))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e),
                Ok(Err(_)) => Some(CacheError::TimedOut(timeout)),
                Err(payload) => Some(CacheError::Panicked(panic_message(payload.as_ref()))),
            };
            match failure {
                None => {
                    debug!("Cache {} succeeded for key {}", op, key);
                    counter!(CACHE_WRITES_TOTAL, "op" => op, "result" => "ok").increment(1);
                }
                Some(e) => {
                    warn!("Cache {} failed for key {}: {}", op, key, e);
                    counter!(CACHE_WRITES_TOTAL, "op" => op, "result" => "error").increment(1);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCacheStore;
    use super::*;

    const BUDGET: Duration = Duration::from_millis(200);

    fn cache_over(store: Arc<MemoryCacheStore>) -> UrlCache {
        UrlCache::new(store, Duration::from_secs(1))
    }

    #[test]
    fn test_cache_key_layout() {
        let key = CacheKey::new("avatars", "u1/a.jpg");
        assert_eq!(key.as_str(), "avatars:u1/a.jpg");
        assert_eq!(key.to_string(), "avatars:u1/a.jpg");
        // Colons in the path stay after the first separator.
        assert_ne!(CacheKey::new("a", "b:c"), CacheKey::new("a", "b"));
        assert_eq!(CacheKey::new("a", "b:c").as_str().split_once(':'), Some(("a", "b:c")));
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = cache_over(store.clone());
        let key = CacheKey::new("avatars", "u1/a.jpg");
        let ttl = Duration::from_secs(3600);

        cache
            .store(key.clone(), "https://signed/1".to_string(), ttl)
            .await
            .unwrap();

        let hit = cache.lookup(&key, BUDGET).await.unwrap();
        assert_eq!(hit.url, "https://signed/1");
        assert!(hit.seconds_remaining <= 3600);
        assert!(hit.seconds_remaining > 3600 - 5);
        assert_eq!(store.ttl(key.as_str()).await.map(|d| d.as_secs() <= 3600), Some(true));
    }

    #[tokio::test]
    async fn test_connect_url_cache_without_url_is_disabled() {
        let config = CacheConfig::default();
        assert!(connect_url_cache(&config, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_connect_url_cache_unreachable_is_disabled_within_timeout() {
        let config = CacheConfig {
            redis_url: Some("redis://127.0.0.1:1/".to_string()),
            connect_timeout_ms: 200,
        };
        let started = tokio::time::Instant::now();
        assert!(connect_url_cache(&config, Duration::from_secs(1)).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(200) + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_missing_key_is_miss() {
        let cache = cache_over(Arc::new(MemoryCacheStore::new()));
        assert!(cache
            .lookup(&CacheKey::new("avatars", "nope"), BUDGET)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        let past = (unix_now() - 10).to_string();
        store.insert_raw("avatars:old", Some("https://old"), Some(&past)).await;
        let cache = cache_over(store.clone());

        assert!(cache
            .lookup(&CacheKey::new("avatars", "old"), BUDGET)
            .await
            .is_none());
        // Expired but well-formed entries are left to the store's TTL.
        assert_eq!(store.deletes(), 0);
    }

    #[tokio::test]
    async fn test_entry_without_url_is_miss() {
        let store = Arc::new(MemoryCacheStore::new());
        let future = (unix_now() + 100).to_string();
        store.insert_raw("avatars:x", Some(""), Some(&future)).await;
        store.insert_raw("avatars:y", None, Some(&future)).await;
        let cache = cache_over(store);

        assert!(cache.lookup(&CacheKey::new("avatars", "x"), BUDGET).await.is_none());
        assert!(cache.lookup(&CacheKey::new("avatars", "y"), BUDGET).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_expiry_is_deleted() {
        let store = Arc::new(MemoryCacheStore::new());
        store
            .insert_raw("avatars:bad", Some("https://x"), Some("not-a-number"))
            .await;
        let cache = cache_over(store.clone());

        assert!(cache
            .lookup(&CacheKey::new("avatars", "bad"), BUDGET)
            .await
            .is_none());

        for _ in 0..50 {
            if !store.contains("avatars:bad").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.contains("avatars:bad").await);
        assert_eq!(store.deletes(), 1);
    }

    #[tokio::test]
    async fn test_slow_cache_is_bounded_miss() {
        let store = Arc::new(MemoryCacheStore::new().with_latency(Duration::from_secs(5)));
        let cache = cache_over(store);
        let started = tokio::time::Instant::now();
        assert!(cache
            .lookup(&CacheKey::new("avatars", "a"), Duration::from_millis(50))
            .await
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unavailable_cache_is_miss_and_store_is_silent() {
        let store = Arc::new(MemoryCacheStore::new().unavailable());
        let cache = cache_over(store.clone());
        let key = CacheKey::new("avatars", "a");

        assert!(cache.lookup(&key, BUDGET).await.is_none());
        // Write failures are swallowed; the task itself completes normally.
        cache
            .store(key, "https://x".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_store_overwrites_previous_entry() {
        let store = Arc::new(MemoryCacheStore::new());
        let cache = cache_over(store);
        let key = CacheKey::new("avatars", "a");

        cache
            .store(key.clone(), "https://first".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .store(key.clone(), "https://second".to_string(), Duration::from_secs(120))
            .await
            .unwrap();

        let hit = cache.lookup(&key, BUDGET).await.unwrap();
        assert_eq!(hit.url, "https://second");
        assert!(hit.seconds_remaining > 60);
    }
}
