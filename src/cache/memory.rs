//! In-memory [`CacheStore`] with Redis-like hash and TTL semantics.
//!
//! Expired keys are dropped lazily on access.  Latency and unavailability
//! can be injected, and every operation is counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use super::{CacheFields, CacheFuture, CacheStore};
use crate::errors::CacheError;

struct MemoryEntry {
    fields: HashMap<String, String>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache store.
pub struct MemoryCacheStore {
    entries: tokio::sync::RwLock<HashMap<String, MemoryEntry>>,
    latency: Duration,
    unavailable: bool,
    fetches: AtomicUsize,
    writes: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: tokio::sync::RwLock::new(HashMap::new()),
            latency: Duration::ZERO,
            unavailable: false,
            fetches: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Delay every operation by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every operation as if the server were unreachable.
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Write raw fields without a TTL, bypassing validation.
    pub async fn insert_raw(&self, key: &str, url: Option<&str>, exp: Option<&str>) {
        let mut fields = HashMap::new();
        if let Some(url) = url {
            fields.insert("url".to_string(), url.to_string());
        }
        if let Some(exp) = exp {
            fields.insert("exp".to_string(), exp.to_string());
        }
        self.entries.write().await.insert(
            key.to_string(),
            MemoryEntry {
                fields,
                expires_at: None,
            },
        );
    }

    /// Whether `key` is present and unexpired.
    pub async fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .is_some_and(|e| e.is_live(now))
    }

    /// Remaining TTL of `key`, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Successful writes.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful deletes.
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), CacheError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.unavailable {
            return Err(CacheError::Backend("connection refused".to_string()));
        }
        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn fetch(&self, key: &str) -> CacheFuture<'_, CacheFields> {
        let key = key.to_string();
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.simulate().await?;

            let now = Instant::now();
            let mut entries = self.entries.write().await;
            if entries.get(&key).is_some_and(|e| !e.is_live(now)) {
                entries.remove(&key);
            }
            Ok(entries
                .get(&key)
                .map(|e| CacheFields {
                    url: e.fields.get("url").cloned(),
                    exp: e.fields.get("exp").cloned(),
                })
                .unwrap_or_default())
        })
    }

    fn put(&self, key: &str, url: &str, expires_at: i64, ttl: Duration) -> CacheFuture<'_, ()> {
        let key = key.to_string();
        let url = url.to_string();
        Box::pin(async move {
            self.simulate().await?;

            let mut entries = self.entries.write().await;
            let entry = entries.entry(key).or_insert_with(|| MemoryEntry {
                fields: HashMap::new(),
                expires_at: None,
            });
            entry.fields.insert("url".to_string(), url);
            entry.fields.insert("exp".to_string(), expires_at.to_string());
            entry.expires_at = Some(Instant::now() + ttl);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> CacheFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.simulate().await?;
            self.entries.write().await.remove(&key);
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}
