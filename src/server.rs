//! Axum router construction.
//!
//! The [`app`] function wires the liveness probe, the optional metrics
//! endpoint and the object redirect route, and returns a ready-to-serve
//! [`axum::Router`].
//!
//! Object paths are arbitrary (`/{bucket}/{path...}` with any depth), so the
//! object route is the router fallback and parses the raw URI itself.

use axum::{
    extract::State,
    http::{HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::errors::generate_request_id;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`].
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", get(health_check));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        // Everything else is an object request.
        .fallback(handle_object)
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Adds common response headers to every response:
/// - `x-request-id`: 16-character lowercase hex string
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `cdn-s3`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("cdn-s3"));

    response
}

// -- Handlers -----------------------------------------------------------------

/// `GET /health` -- liveness only.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        "OK",
    )
}

/// `GET|HEAD /{bucket}/{path...}` -- redirect to a signed URL.
async fn handle_object(State(state): State<Arc<AppState>>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [("allow", "GET, HEAD")],
            "Method not allowed",
        )
            .into_response();
    }

    match state.gateway.handle(uri.path()).await {
        Ok(redirect) => redirect.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCacheStore;
    use crate::cache::UrlCache;
    use crate::config::{BackendSettings, BucketsConfig, Config};
    use crate::gateway::Gateway;
    use crate::registry::{BackendRegistry, BackendTarget};
    use crate::storage::backend::ObjectStore;
    use crate::storage::memory::MemoryStore;
    use axum::body::Body;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app(metrics: bool) -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new("eu").with_object("u1/a.jpg"));

        let mut config = Config::default();
        config.observability.metrics = metrics;
        config.buckets = BucketsConfig {
            public_names: Some(vec!["avatars".to_string()]),
            region_aliases: Some(vec!["eu".to_string()]),
            backends: HashMap::from([(
                "avatars".to_string(),
                HashMap::from([(
                    "eu".to_string(),
                    BackendSettings {
                        endpoint: Some("memory://".to_string()),
                        region: Some("local".to_string()),
                        bucket: Some("real".to_string()),
                        path_prefix: None,
                        access_key_id: Some("ak".to_string()),
                        secret_access_key: Some("sk".to_string()),
                        force_path_style: true,
                    },
                )]),
            )]),
        };

        let shared = store.clone();
        let connect = move |_: &str,
                            _: &str,
                            _: &BackendTarget|
              -> anyhow::Result<Arc<dyn ObjectStore>> {
            let store: Arc<dyn ObjectStore> = shared.clone();
            Ok(store)
        };
        let registry = Arc::new(BackendRegistry::build_with(&config.buckets, &connect).unwrap());
        let cache = UrlCache::new(Arc::new(MemoryCacheStore::new()), Duration::from_secs(1));
        let gateway = Gateway::new(registry, Some(cache), config.gateway.clone());

        let state = Arc::new(AppState { config, gateway });
        (app(state), store)
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, store) = test_app(false);
        let response = app.oneshot(request(Method::GET, "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"OK");
        assert_eq!(store.exists_calls(), 0);
    }

    #[tokio::test]
    async fn test_object_redirect() {
        let (app, _) = test_app(false);
        let response = app
            .oneshot(request(Method::GET, "/avatars/u1/a.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()["location"].to_str().unwrap();
        assert!(location.starts_with("memory://eu/u1/a.jpg?"));
        let max_age = 7 * 24 * 3600 - 8 * 3600;
        assert_eq!(
            response.headers()["cache-control"],
            format!("max-age={max_age}").as_str()
        );
    }

    #[tokio::test]
    async fn test_head_redirects_too() {
        let (app, _) = test_app(false);
        let response = app
            .oneshot(request(Method::HEAD, "/avatars/u1/a.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    #[tokio::test]
    async fn test_missing_object_is_404_without_cache_control() {
        let (app, _) = test_app(false);
        let response = app
            .oneshot(request(Method::GET, "/avatars/none.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("cache-control").is_none());
    }

    #[tokio::test]
    async fn test_malformed_path_is_404() {
        let (app, store) = test_app(false);
        for uri in ["/", "/avatars", "/avatars/"] {
            let response = app.clone().oneshot(request(Method::GET, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
        assert_eq!(store.exists_calls(), 0);
    }

    #[tokio::test]
    async fn test_other_methods_are_rejected() {
        let (app, store) = test_app(false);
        let response = app
            .oneshot(request(Method::PUT, "/avatars/u1/a.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(store.exists_calls(), 0);
    }

    #[tokio::test]
    async fn test_common_headers() {
        let (app, _) = test_app(false);
        let response = app.oneshot(request(Method::GET, "/health")).await.unwrap();
        let headers = response.headers();
        assert_eq!(headers["server"], "cdn-s3");
        assert_eq!(headers["x-request-id"].len(), 16);
        assert!(headers.contains_key("date"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_toggle() {
        crate::metrics::init_metrics();

        let (app, _) = test_app(true);
        let response = app.oneshot(request(Method::GET, "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Without the route, /metrics is just a malformed object path.
        let (app, _) = test_app(false);
        let response = app.oneshot(request(Method::GET, "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
