//! Error types for the gateway.
//!
//! Each concern gets its own enum.  Only [`GatewayError`] ever reaches a
//! client; it implements [`axum::response::IntoResponse`] so the object
//! route can simply return `Err(GatewayError::NotFound)`.  Probe and cache
//! failures are swallowed where they happen and only logged.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes)
}

/// Startup configuration failures.  All of them are fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No public bucket aliases were configured.
    #[error("public bucket aliases are required (buckets.public_names / CDN_BUCKET_PUBLIC_NAMES)")]
    MissingBucketAliases,

    /// No region aliases were configured.
    #[error("region aliases are required (buckets.region_aliases / CDN_BUCKET_REGION_ALIASES)")]
    MissingRegionAliases,

    /// A timing setting is out of range.
    #[error("invalid timing configuration: {0}")]
    InvalidTiming(String),

    /// A listen address could not be interpreted.
    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),

    /// A storage client could not be created for a configured pair.
    #[error("failed to create storage client for {bucket}/{region}: {source}")]
    Backend {
        bucket: String,
        region: String,
        #[source]
        source: anyhow::Error,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for [`crate::config::Config`].
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Presigning failed after existence was already confirmed.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The backend rejected the request or credentials were unusable.
    #[error("failed to presign {bucket}/{key}: {source}")]
    Backend {
        bucket: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// The presign call did not finish within its budget.
    #[error("presigning {bucket}/{key} timed out after {elapsed:?}")]
    TimedOut {
        bucket: String,
        key: String,
        elapsed: Duration,
    },
}

/// Any failure on the cache side.  Never surfaced to clients.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache store returned an error (connection, protocol, ...).
    #[error("cache backend error: {0}")]
    Backend(String),

    /// The operation exceeded its time budget.
    #[error("cache operation timed out after {0:?}")]
    TimedOut(Duration),

    /// The stored expiry of an entry is not a decimal Unix timestamp.
    #[error("corrupt cache entry {key}: unparsable expiry '{raw}'")]
    CorruptExpiry { key: String, raw: String },

    /// A background cache task panicked.
    #[error("cache task panicked: {0}")]
    Panicked(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Why a single existence probe produced no result.
#[derive(Debug, Error)]
pub enum ProbeFailure {
    /// Transport, auth or any other backend error.
    #[error("probe failed: {0}")]
    Backend(#[from] anyhow::Error),

    /// The probe exceeded the per-probe timeout.
    #[error("probe timed out after {0:?}")]
    TimedOut(Duration),

    /// The probe task panicked.
    #[error("probe panicked: {0}")]
    Panicked(String),
}

impl ProbeFailure {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeFailure::Backend(_) => "backend",
            ProbeFailure::TimedOut(_) => "timeout",
            ProbeFailure::Panicked(_) => "panic",
        }
    }
}

/// Errors a request can end in.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The request path is not `{bucket}/{object}`.
    #[error("malformed request path '{0}'")]
    MalformedPath(String),

    /// No live region has the object, or the deadline elapsed.
    #[error("object not found")]
    NotFound,

    /// The object was found but no URL could be signed.
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl GatewayError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::MalformedPath(_) => StatusCode::NOT_FOUND,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = match self.status_code() {
            StatusCode::NOT_FOUND => "Not found",
            _ => "Internal server error",
        };
        (
            self.status_code(),
            [("content-type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

/// Render a caught panic payload as text.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
