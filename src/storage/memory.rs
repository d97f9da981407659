//! In-memory object store.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>`.  Presigned
//! URLs use a `memory://{name}/{key}` scheme and are never dereferenced.
//!
//! The store can simulate a slow, failing or panicking region, and keeps
//! call and in-flight counters so races can be observed from outside.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::backend::{ObjectStore, StoreFuture};

/// Failure injected into existence checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// Behave normally.
    #[default]
    None,
    /// Return an error after the configured latency.
    Error,
    /// Panic after the configured latency.
    Panic,
}

/// A stored object with its content type.
#[derive(Debug, Clone)]
pub struct MemoryObject {
    pub data: Bytes,
    pub content_type: String,
}

/// In-memory [`ObjectStore`].
pub struct MemoryStore {
    /// Label used as the host of presigned URLs.
    name: String,
    /// key -> object.
    objects: tokio::sync::RwLock<HashMap<String, MemoryObject>>,
    /// Delay before every existence check answers.
    latency: Duration,
    /// Fault applied to existence checks.
    fault: Fault,
    /// Whether presigning fails.
    presign_fails: bool,
    exists_calls: AtomicUsize,
    presign_calls: AtomicUsize,
    /// Existence checks currently running; drops back when a check is
    /// cancelled.
    in_flight: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty, healthy store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: tokio::sync::RwLock::new(HashMap::new()),
            latency: Duration::ZERO,
            fault: Fault::None,
            presign_fails: false,
            exists_calls: AtomicUsize::new(0),
            presign_calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Delay every existence check by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Inject `fault` into every existence check.
    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// Make every presign call fail.
    pub fn with_failing_presign(mut self) -> Self {
        self.presign_fails = true;
        self
    }

    /// Seed an object before the store is shared.
    pub fn with_object(mut self, key: &str) -> Self {
        self.objects.get_mut().insert(
            key.to_string(),
            MemoryObject {
                data: Bytes::new(),
                content_type: mime::APPLICATION_OCTET_STREAM.to_string(),
            },
        );
        self
    }

    /// Fetch a stored object.
    pub async fn get(&self, key: &str) -> Option<MemoryObject> {
        self.objects.read().await.get(key).cloned()
    }

    /// Number of existence checks started so far.
    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    /// Number of presign calls so far.
    pub fn presign_calls(&self) -> usize {
        self.presign_calls.load(Ordering::SeqCst)
    }

    /// Existence checks that have started but neither finished nor been
    /// dropped.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when a check finishes or is dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ObjectStore for MemoryStore {
    fn exists(&self, key: &str) -> StoreFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            let _guard = InFlight::enter(&self.in_flight);

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            match self.fault {
                Fault::None => Ok(self.objects.read().await.contains_key(&key)),
                Fault::Error => anyhow::bail!("simulated backend failure in {}", self.name),
                Fault::Panic => panic!("simulated panic in {}", self.name),
            }
        })
    }

    fn presign_get(&self, key: &str, expires_in: Duration) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            self.presign_calls.fetch_add(1, Ordering::SeqCst);
            if self.presign_fails {
                anyhow::bail!("simulated presign failure in {}", self.name);
            }
            let issued = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
            Ok(format!(
                "memory://{}/{}?issued={}&expires={}",
                self.name,
                key,
                issued,
                expires_in.as_secs()
            ))
        })
    }

    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let content_type = content_type.to_string();
        Box::pin(async move {
            self.objects
                .write()
                .await
                .insert(key, MemoryObject { data, content_type });
            Ok(())
        })
    }
}
