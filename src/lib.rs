//! cdn-s3 library: CDN edge gateway over regional S3-compatible replicas.
//!
//! A request for `/{bucket}/{path}` is answered with a redirect to a
//! presigned URL on whichever regional replica holds the object and answers
//! first.  Signed URLs are cached in Redis so the hot path never touches a
//! backend.

pub mod cache;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod metrics;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod signer;
pub mod storage;
pub mod upload;

use crate::config::Config;
use crate::gateway::Gateway;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Request orchestrator (registry, resolver, signer, cache).
    pub gateway: Gateway,
}
