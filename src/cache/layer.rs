//! Cache middleware placed directly in front of the application.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody as _},
    extract::State,
    http::{header, request::Parts, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::entry::{request_bypasses_cache, response_ttl};
use super::{CacheEntry, CacheHandle, CachedResponse, Fingerprint};
use crate::config::CacheConfig;
use crate::observability::metrics;

/// Header reporting whether the response came from the cache.
pub const X_CACHE: &str = "x-cache";

/// Tunables of the cache middleware.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Duration,
    pub max_body_bytes: usize,
    pub vary: Arc<[String]>,
}

impl CacheSettings {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.ttl(),
            max_body_bytes: config.max_body_bytes,
            vary: config
                .vary_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }
}

/// State handed to `cache_middleware`.
#[derive(Clone)]
pub struct CacheLayerState {
    pub store: CacheHandle,
    pub settings: CacheSettings,
}

impl CacheLayerState {
    pub fn new(store: CacheHandle, settings: CacheSettings) -> Self {
        Self { store, settings }
    }
}

fn purge_method() -> Method {
    Method::from_bytes(b"PURGE").unwrap_or(Method::DELETE)
}

pub async fn cache_middleware(
    State(state): State<CacheLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();

    if method == purge_method() {
        let (parts, _) = request.into_parts();
        return purge(&state, &parts).await;
    }
    if method != Method::GET && method != Method::HEAD {
        return next.run(request).await;
    }

    let fingerprint = Fingerprint::of_parts(
        &method,
        request.uri(),
        request.headers(),
        &state.settings.vary,
    );

    if request_bypasses_cache(request.headers()) {
        metrics::record_cache_lookup("bypass");
    } else if let Some(entry) = state.store.lookup(&fingerprint).await {
        metrics::record_cache_lookup("hit");
        tracing::debug!(fingerprint = %fingerprint, uri = %request.uri(), "Cache hit");
        return hit_response(&entry, method == Method::HEAD);
    } else {
        metrics::record_cache_lookup("miss");
    }

    let response = next.run(request).await;
    store_response(&state, fingerprint, response).await
}

/// Request head only; `Body` is not `Sync`.
async fn purge(state: &CacheLayerState, request: &Parts) -> Response {
    let mut removed = false;
    for method in [Method::GET, Method::HEAD] {
        let fp = Fingerprint::of_parts(&method, &request.uri, &request.headers, &state.settings.vary);
        removed |= state.store.purge(&fp).await;
    }
    metrics::record_cache_purge();
    tracing::info!(uri = %request.uri, removed, "Cache purge");

    let body = if removed { "purged\n" } else { "not cached\n" };
    (StatusCode::OK, [(X_CACHE, "PURGE")], body).into_response()
}

fn hit_response(entry: &CacheEntry, head: bool) -> Response {
    let cached = &entry.response;
    let body = if head {
        Body::empty()
    } else {
        Body::from(cached.body.clone())
    };

    let mut response = Response::new(body);
    *response.status_mut() = cached.status;
    let headers = response.headers_mut();
    headers.extend(cached.headers.clone());
    headers.insert(X_CACHE, HeaderValue::from_static("HIT"));
    headers.insert(header::AGE, HeaderValue::from(entry.age().as_secs()));
    response
}

async fn store_response(state: &CacheLayerState, fingerprint: Fingerprint, response: Response) -> Response {
    let Some(ttl) = response_ttl(response.status(), response.headers(), state.settings.default_ttl) else {
        return mark_miss(response);
    };
    let fits = response
        .body()
        .size_hint()
        .upper()
        .is_some_and(|n| n <= state.settings.max_body_bytes as u64);
    if !fits {
        return mark_miss(response);
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, state.settings.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to buffer response for caching");
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let cached = CachedResponse::new(parts.status, &parts.headers, bytes.clone());
    state.store.store(CacheEntry::new(fingerprint, cached, ttl)).await;
    metrics::record_cache_store();

    mark_miss(Response::from_parts(parts, Body::from(bytes)))
}

fn mark_miss(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("MISS"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use axum::{middleware, routing::get, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn app(calls: Arc<AtomicUsize>, ttl: Duration) -> (Router, LocalCache) {
        let store = LocalCache::new(None);
        let settings = CacheSettings {
            default_ttl: ttl,
            max_body_bytes: 1024,
            vary: Arc::from(vec!["accept".to_string()]),
        };
        let state = CacheLayerState::new(Arc::new(store.clone()), settings);

        let counter = calls.clone();
        let private_calls = calls;
        let router = Router::new()
            .route(
                "/page",
                get(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { format!("call {n}") }
                }),
            )
            .route(
                "/private",
                get(move || {
                    private_calls.fetch_add(1, Ordering::SeqCst);
                    async { ([(header::CACHE_CONTROL, "private")], "secret") }
                }),
            )
            .route("/large", get(|| async { "x".repeat(4096) }))
            .layer(middleware::from_fn_with_state(state, cache_middleware));
        (router, store)
    }

    fn get_req(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("host", "example.com")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, _) = app(calls.clone(), Duration::from_secs(60));

        let first = router.clone().oneshot(get_req("/page")).await.unwrap();
        assert_eq!(first.headers()[X_CACHE], "MISS");
        assert_eq!(body_text(first).await, "call 1");

        let second = router.oneshot(get_req("/page")).await.unwrap();
        assert_eq!(second.headers()[X_CACHE], "HIT");
        assert!(second.headers().contains_key(header::AGE));
        assert_eq!(body_text(second).await, "call 1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_calls_application_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, _) = app(calls.clone(), Duration::from_millis(50));

        router.clone().oneshot(get_req("/page")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = router.oneshot(get_req("/page")).await.unwrap();
        assert_eq!(again.headers()[X_CACHE], "MISS");
        assert_eq!(body_text(again).await, "call 2");
    }

    #[tokio::test]
    async fn no_cache_request_skips_lookup_but_refreshes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, _) = app(calls.clone(), Duration::from_secs(60));
        router.clone().oneshot(get_req("/page")).await.unwrap();

        let bypass = Request::builder()
            .uri("/page")
            .header("host", "example.com")
            .header("cache-control", "no-cache")
            .body(Body::empty())
            .unwrap();
        let fresh = router.clone().oneshot(bypass).await.unwrap();
        assert_eq!(body_text(fresh).await, "call 2");

        let cached = router.oneshot(get_req("/page")).await.unwrap();
        assert_eq!(body_text(cached).await, "call 2");
    }

    #[tokio::test]
    async fn uncacheable_responses_are_not_stored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, store) = app(calls.clone(), Duration::from_secs(60));

        router.clone().oneshot(get_req("/private")).await.unwrap();
        router.clone().oneshot(get_req("/private")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let large = router.oneshot(get_req("/large")).await.unwrap();
        assert_eq!(large.headers()[X_CACHE], "MISS");
        assert_eq!(body_text(large).await.len(), 4096);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn purge_drops_the_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, store) = app(calls.clone(), Duration::from_secs(60));
        router.clone().oneshot(get_req("/page")).await.unwrap();
        assert_eq!(store.len(), 1);

        let purge = Request::builder()
            .method("PURGE")
            .uri("/page")
            .header("host", "example.com")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(purge).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.is_empty());

        let after = router.oneshot(get_req("/page")).await.unwrap();
        assert_eq!(body_text(after).await, "call 2");
    }

    #[tokio::test]
    async fn vary_header_separates_entries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (router, _) = app(calls.clone(), Duration::from_secs(60));
        router.clone().oneshot(get_req("/page")).await.unwrap();

        let json = Request::builder()
            .uri("/page")
            .header("host", "example.com")
            .header("accept", "application/json")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(json).await.unwrap();
        assert_eq!(response.headers()[X_CACHE], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
