//! Prometheus metrics for the gateway.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.
//!
//! The `counter!` calls spread through the crate are no-ops until
//! [`init_metrics`] installs the recorder.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "cdn_s3_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "cdn_s3_http_request_duration_seconds";

/// URL cache lookups (counter). Labels: result (hit, miss, expired, corrupt, error).
pub const CACHE_LOOKUPS_TOTAL: &str = "cdn_s3_cache_lookups_total";

/// Detached cache writes and deletes (counter). Labels: op, result.
pub const CACHE_WRITES_TOTAL: &str = "cdn_s3_cache_writes_total";

/// Region races (counter). Labels: outcome (found, exhausted, deadline, no_backends).
pub const RESOLUTIONS_TOTAL: &str = "cdn_s3_resolutions_total";

/// Region race duration in seconds (histogram). Labels: outcome.
pub const RESOLUTION_DURATION_SECONDS: &str = "cdn_s3_resolution_duration_seconds";

/// Failed existence probes (counter). Labels: region, reason.
pub const PROBE_FAILURES_TOTAL: &str = "cdn_s3_probe_failures_total";

/// Presign failures (counter). Labels: region.
pub const SIGNING_FAILURES_TOTAL: &str = "cdn_s3_signing_failures_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        // Another recorder may already be installed (tests); keep rendering
        // through our own handle either way.
        let _ = metrics::set_global_recorder(recorder);
        handle
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(CACHE_LOOKUPS_TOTAL, "Signed URL cache lookups by result");
    describe_counter!(CACHE_WRITES_TOTAL, "Detached cache writes and deletes");
    describe_counter!(RESOLUTIONS_TOTAL, "Region races by outcome");
    describe_histogram!(
        RESOLUTION_DURATION_SECONDS,
        "Region race duration in seconds"
    );
    describe_counter!(PROBE_FAILURES_TOTAL, "Failed existence probes");
    describe_counter!(SIGNING_FAILURES_TOTAL, "Presign failures");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from unique bucket/object names.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/avatars` -> `/{bucket}`
/// - `/avatars/u1/a.jpg` -> `/{bucket}/{object}`
/// - `/` -> `/`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" => path.to_string(),
        _ => {
            let trimmed = path.trim_start_matches('/');
            if trimmed.is_empty() {
                return "/".to_string();
            }
            match trimmed.find('/') {
                None => "/{bucket}".to_string(),
                Some(_) => "/{bucket}/{object}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_root() {
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn test_normalize_path_health() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_normalize_path_bucket() {
        assert_eq!(normalize_path("/avatars"), "/{bucket}");
        assert_eq!(normalize_path("//"), "/");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/avatars/a.jpg"), "/{bucket}/{object}");
        assert_eq!(
            normalize_path("/avatars/u1/deep/a.jpg"),
            "/{bucket}/{object}"
        );
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics() as *const PrometheusHandle;
        let second = init_metrics() as *const PrometheusHandle;
        assert_eq!(first, second);
    }
}
