//! Shared cache server and the client workers use to reach it.
//!
//! # Wire protocol (HTTP on `cache_port`)
//! ```text
//! GET    /entries/{fp}  → 200 + body + x-hx-* metadata, or 404
//! PUT    /entries/{fp}  ← body + x-hx-* metadata        → 204
//! DELETE /entries/{fp}                                   → 204 / 404
//! DELETE /entries                                        → 204
//! ```
//! Metadata headers: `x-hx-status`, `x-hx-headers` (JSON array of
//! `[name, hex-encoded value]`), `x-hx-ttl-ms` (remaining lifetime),
//! `x-hx-age-ms`. An entry with no lifetime left is a miss.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Router,
};
use bytes::Bytes;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::task::JoinHandle;

use super::{CacheEntry, CacheStore, CachedResponse, Fingerprint, LocalCache};
use crate::error::ServeError;
use crate::net::ListenerBinding;
use crate::observability::metrics;

const STATUS_HEADER: &str = "x-hx-status";
const HEADERS_HEADER: &str = "x-hx-headers";
const TTL_HEADER: &str = "x-hx-ttl-ms";
const AGE_HEADER: &str = "x-hx-age-ms";

/// Bound on one round trip to the cache server; a slow cache is a miss.
const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest body accepted in either direction.
const MAX_ENTRY_BYTES: usize = 64 * 1024 * 1024;

/// Cache server hosted by the supervising process.
pub struct CacheServer {
    store: LocalCache,
    handle: axum_server::Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl CacheServer {
    /// HTTP interface over a store.
    pub fn router(store: LocalCache) -> Router {
        Router::new()
            .route("/entries", delete(purge_all))
            .route(
                "/entries/{fp}",
                get(fetch_entry).put(put_entry).delete(delete_entry),
            )
            .layer(DefaultBodyLimit::max(MAX_ENTRY_BYTES))
            .with_state(store)
    }

    /// Start serving on the cache listener.
    pub fn start(binding: ListenerBinding, max_entries: Option<usize>) -> Result<Self, ServeError> {
        let store = LocalCache::new(max_entries);
        let address = binding.local_addr()?;
        let (socket, _) = binding.into_parts();
        socket.set_nonblocking(true)?;

        let handle = axum_server::Handle::new();
        let app = Self::router(store.clone());
        let server = axum_server::from_tcp(socket).handle(handle.clone());
        let task = tokio::spawn(async move { server.serve(app.into_make_service()).await });

        tracing::info!(address = %address, "Global cache server started");
        Ok(Self {
            store,
            handle,
            task,
        })
    }

    /// Address once the server is accepting.
    pub async fn ready(&self) -> Option<SocketAddr> {
        self.handle.listening().await
    }

    pub fn entries(&self) -> usize {
        self.store.len()
    }

    pub async fn shutdown(self, grace: Duration) {
        self.handle.graceful_shutdown(Some(grace));
        match self.task.await {
            Ok(Ok(())) => tracing::info!("Global cache server stopped"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Global cache server ended with error"),
            Err(e) => tracing::warn!(error = %e, "Global cache server task failed"),
        }
    }
}

async fn fetch_entry(State(store): State<LocalCache>, Path(fp): Path<String>) -> Response {
    let Some(fp) = Fingerprint::from_hex(&fp) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(entry) = store.get(&fp) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut metadata = match encode_metadata(&entry.response) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(fingerprint = %fp, error = %e, "Unencodable cache entry");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    metadata.insert(TTL_HEADER, HeaderValue::from(entry.remaining().as_millis() as u64));
    metadata.insert(AGE_HEADER, HeaderValue::from(entry.age().as_millis() as u64));

    (StatusCode::OK, metadata, entry.response.body.clone()).into_response()
}

async fn put_entry(
    State(store): State<LocalCache>,
    Path(fp): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(fp) = Fingerprint::from_hex(&fp) else {
        return StatusCode::BAD_REQUEST;
    };
    let Some(ttl) = millis_header(&headers, TTL_HEADER) else {
        return StatusCode::BAD_REQUEST;
    };
    match decode_metadata(&headers, body) {
        Ok(response) => {
            store.insert(CacheEntry::new(fp, response, ttl));
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            tracing::debug!(error = %e, "Rejected cache entry");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn delete_entry(State(store): State<LocalCache>, Path(fp): Path<String>) -> StatusCode {
    match Fingerprint::from_hex(&fp) {
        Some(fp) if store.remove(&fp) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}

async fn purge_all(State(store): State<LocalCache>) -> StatusCode {
    store.clear();
    StatusCode::NO_CONTENT
}

/// Values travel hex-encoded: header values may carry bytes that are not
/// visible ASCII.
fn encode_metadata(response: &CachedResponse) -> Result<HeaderMap, String> {
    let pairs: Vec<(&str, String)> = response
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), hex::encode(value.as_bytes())))
        .collect();
    let json = serde_json::to_string(&pairs).map_err(|e| e.to_string())?;

    let mut headers = HeaderMap::new();
    headers.insert(STATUS_HEADER, HeaderValue::from(response.status.as_u16()));
    headers.insert(
        HEADERS_HEADER,
        HeaderValue::from_str(&json).map_err(|e| e.to_string())?,
    );
    Ok(headers)
}

fn decode_metadata(headers: &HeaderMap, body: Bytes) -> Result<CachedResponse, String> {
    let status = headers
        .get(STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|v| StatusCode::from_u16(v).ok())
        .ok_or_else(|| format!("missing or invalid {STATUS_HEADER}"))?;
    let json = headers
        .get(HEADERS_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| format!("missing {HEADERS_HEADER}"))?;
    let pairs: Vec<(String, String)> = serde_json::from_str(json).map_err(|e| e.to_string())?;

    let mut stored = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
        let value = hex::decode(&value).map_err(|e| e.to_string())?;
        let value = HeaderValue::from_bytes(&value).map_err(|e| e.to_string())?;
        stored.append(name, value);
    }
    Ok(CachedResponse::new(status, &stored, body))
}

fn millis_header(headers: &HeaderMap, name: &str) -> Option<Duration> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Worker-side view of the cache server.
///
/// Every failure (connect, timeout, malformed reply) is logged and reported
/// as a miss; the request then goes to the application.
#[derive(Clone)]
pub struct GlobalCacheClient {
    client: Client<HttpConnector, Body>,
    base: Arc<str>,
}

impl GlobalCacheClient {
    pub fn new(host: IpAddr, port: u16) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            client,
            base: format!("http://{}", SocketAddr::new(host, port)).into(),
        }
    }

    async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, String> {
        let response = tokio::time::timeout(ROUND_TRIP_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| "timed out".to_string())?
            .map_err(|e| e.to_string())?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    fn request(&self, method: Method, path: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base, path))
    }

    async fn fetch(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>, String> {
        let request = self
            .request(Method::GET, &format!("/entries/{fp}"))
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = self.round_trip(request).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            other => return Err(format!("cache server answered {other}")),
        }

        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, MAX_ENTRY_BYTES)
            .await
            .map_err(|e| e.to_string())?;
        let remaining = millis_header(&parts.headers, TTL_HEADER)
            .ok_or_else(|| format!("missing {TTL_HEADER}"))?;
        if remaining.is_zero() {
            return Ok(None);
        }
        let age = millis_header(&parts.headers, AGE_HEADER).unwrap_or_default();
        let cached = decode_metadata(&parts.headers, body)?;
        Ok(Some(CacheEntry::restore(fp.clone(), cached, age, remaining)))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), String> {
        let mut builder = self.request(Method::PUT, &format!("/entries/{}", entry.fingerprint));
        if let Some(headers) = builder.headers_mut() {
            headers.extend(encode_metadata(&entry.response)?);
            headers.insert(
                TTL_HEADER,
                HeaderValue::from(entry.remaining().as_millis() as u64),
            );
        }
        let request = builder
            .body(Body::from(entry.response.body.clone()))
            .map_err(|e| e.to_string())?;
        expect_success(self.round_trip(request).await?)
    }

    async fn delete(&self, path: &str) -> Result<bool, String> {
        let request = self
            .request(Method::DELETE, path)
            .body(Body::empty())
            .map_err(|e| e.to_string())?;
        let response = self.round_trip(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_success(response).map(|()| true)
    }
}

fn expect_success(response: Response<Body>) -> Result<(), String> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("cache server answered {}", response.status()))
    }
}

#[async_trait]
impl CacheStore for GlobalCacheClient {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        match self.fetch(fingerprint).await {
            Ok(entry) => entry.map(Arc::new),
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Global cache lookup failed");
                metrics::record_cache_error("lookup");
                None
            }
        }
    }

    async fn store(&self, entry: CacheEntry) {
        if let Err(e) = self.put(&entry).await {
            tracing::warn!(fingerprint = %entry.fingerprint, error = %e, "Global cache store failed");
            metrics::record_cache_error("store");
        }
    }

    async fn purge(&self, fingerprint: &Fingerprint) -> bool {
        match self.delete(&format!("/entries/{fingerprint}")).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Global cache purge failed");
                metrics::record_cache_error("purge");
                false
            }
        }
    }

    async fn purge_all(&self) {
        if let Err(e) = self.delete("/entries").await {
            tracing::warn!(error = %e, "Global cache purge failed");
            metrics::record_cache_error("purge");
        }
    }
}
