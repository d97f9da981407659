//! Per-request orchestration: parse, cache lookup, resolve, sign, respond.
//!
//! ```text
//! ParsePath -> CacheLookup -> HIT  -> Respond(302, remaining)
//!                          -> MISS -> Resolve -> NOT_FOUND -> 404
//!                                             -> FOUND     -> Sign -> Respond(302, max age)
//!                                                                  -> CacheStore (detached)
//! ```

use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use tracing::debug;

use crate::cache::{CacheKey, UrlCache};
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::registry::BackendRegistry;
use crate::resolver::{RegionResolver, ResolutionOutcome};
use crate::signer::Signer;

/// A parsed `/{bucket}/{object}` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRequest {
    pub bucket: String,
    pub object_path: String,
}

/// Split a raw request path into bucket alias and object path.
///
/// The path is percent-decoded first.  After dropping one leading `/`, the
/// first `/` separates the alias from the object path and both must be
/// non-empty; everything after it is the object path, verbatim.
pub fn parse_path(raw: &str) -> Result<ObjectRequest, GatewayError> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|_| GatewayError::MalformedPath(raw.to_string()))?;
    let path = decoded.strip_prefix('/').unwrap_or(&decoded);

    match path.split_once('/') {
        Some((bucket, object_path)) if !bucket.is_empty() && !object_path.is_empty() => {
            Ok(ObjectRequest {
                bucket: bucket.to_string(),
                object_path: object_path.to_string(),
            })
        }
        _ => Err(GatewayError::MalformedPath(raw.to_string())),
    }
}

/// Successful answer: redirect to a signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub location: String,
    /// Seconds clients and intermediaries may reuse the redirect.
    pub max_age: u64,
}

impl IntoResponse for Redirect {
    fn into_response(self) -> Response {
        let Ok(location) = HeaderValue::from_str(&self.location) else {
            // Signed URLs are ASCII; anything else is a backend bug.
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        };
        (
            StatusCode::FOUND,
            [
                (header::LOCATION, location),
                (
                    header::CACHE_CONTROL,
                    HeaderValue::from_str(&format!("max-age={}", self.max_age))
                        .unwrap_or_else(|_| HeaderValue::from_static("no-store")),
                ),
            ],
        )
            .into_response()
    }
}

/// Request orchestrator.  Cheap to share; holds only immutable state.
pub struct Gateway {
    registry: Arc<BackendRegistry>,
    resolver: RegionResolver,
    signer: Signer,
    cache: Option<UrlCache>,
    settings: GatewayConfig,
}

impl Gateway {
    pub fn new(
        registry: Arc<BackendRegistry>,
        cache: Option<UrlCache>,
        settings: GatewayConfig,
    ) -> Self {
        Self {
            resolver: RegionResolver::new(registry.clone(), settings.probe_timeout()),
            signer: Signer::new(settings.sign_timeout()),
            registry,
            cache,
            settings,
        }
    }

    /// Whether a signed URL cache is attached.
    pub fn caching_enabled(&self) -> bool {
        self.cache.is_some()
    }

    /// Serve one object request.
    pub async fn handle(&self, raw_path: &str) -> Result<Redirect, GatewayError> {
        let request = parse_path(raw_path)?;
        if !self.registry.contains_bucket(&request.bucket) {
            debug!("Unknown bucket alias {}", request.bucket);
            return Err(GatewayError::NotFound);
        }

        let key = CacheKey::new(&request.bucket, &request.object_path);

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache
                .lookup(&key, self.settings.cache_lookup_timeout())
                .await
            {
                debug!("Cache hit for {} ({}s left)", key, hit.seconds_remaining);
                return Ok(Redirect {
                    location: hit.url,
                    max_age: hit.seconds_remaining,
                });
            }
        }

        let outcome = self
            .resolver
            .resolve(
                &request.bucket,
                &request.object_path,
                self.settings.resolve_deadline(),
            )
            .await;

        let ResolutionOutcome::Found {
            descriptor,
            resolved_path,
        } = outcome
        else {
            return Err(GatewayError::NotFound);
        };

        let url = self
            .signer
            .sign(&descriptor, &resolved_path, self.settings.presign_ttl())
            .await?;

        let max_age = self.settings.cache_max_age();
        if let Some(cache) = &self.cache {
            cache.store(key, url.clone(), max_age);
        }

        Ok(Redirect {
            location: url,
            max_age: max_age.as_secs(),
        })
    }
}
