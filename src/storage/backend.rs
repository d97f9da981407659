//! Abstract object storage capability.
//!
//! Every backend must implement [`ObjectStore`].  Keys passed in are final
//! backend keys; the caller has already applied any path prefix.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by [`ObjectStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Async object storage contract.
///
/// Dropping a returned future must abort the underlying call.
pub trait ObjectStore: Send + Sync + 'static {
    /// Check whether an object exists at `key`.
    fn exists(&self, key: &str) -> StoreFuture<'_, bool>;

    /// Produce a URL granting read access to `key` for `expires_in`.
    fn presign_get(&self, key: &str, expires_in: Duration) -> StoreFuture<'_, String>;

    /// Write `data` to `key` with the given content type.
    fn put(&self, key: &str, data: Bytes, content_type: &str) -> StoreFuture<'_, ()>;
}
