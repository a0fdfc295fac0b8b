//! Bundled application: forward every request to one upstream address.
//!
//! # Responsibilities
//! - Parse and validate the upstream address (`--wsgi` / `upstream.address`)
//! - Stream requests and responses without buffering bodies
//! - Strip hop-by-hop headers in both directions
//! - Map upstream failures to 502 / 504; dev mode adds the failure detail

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        uri::{Authority, Scheme},
        header, HeaderMap, HeaderValue, Request, StatusCode, Uri, Version,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use url::Url;

use crate::cache::entry::is_hop_by_hop;
use crate::config::ServingConfig;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Validated upstream location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    authority: Authority,
}

impl UpstreamTarget {
    /// Accepts `http://host:port[/]` or bare `host:port`.
    pub fn parse(address: &str) -> Result<Self, String> {
        let address = address.trim();
        let with_scheme = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| e.to_string())?;

        if url.scheme() != "http" {
            return Err(format!("unsupported scheme '{}', only http is proxied", url.scheme()));
        }
        let host = url.host_str().ok_or("missing host")?;
        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err("upstream address must not carry a path or query".to_string());
        }
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let authority = authority.parse::<Authority>().map_err(|e| e.to_string())?;
        Ok(Self { authority })
    }

    pub fn authority(&self) -> &str {
        self.authority.as_str()
    }

    fn uri_for(&self, original: &Uri) -> Result<Uri, axum::http::Error> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }
}

/// Forwarding behavior.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub timeout: Duration,
    /// Put the failure detail in error bodies (dev mode).
    pub verbose_errors: bool,
}

impl UpstreamSettings {
    pub fn from_config(config: &ServingConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.upstream.timeout_secs),
            verbose_errors: config.dev_mode,
        }
    }
}

#[derive(Clone)]
struct ProxyState {
    target: Arc<UpstreamTarget>,
    settings: UpstreamSettings,
    client: Client<HttpConnector, Body>,
}

/// Router forwarding every path and method upstream.
pub fn router(target: UpstreamTarget, settings: UpstreamSettings) -> Router {
    let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
    let state = ProxyState {
        target: Arc::new(target),
        settings,
        client,
    };
    Router::new()
        .route("/{*path}", any(proxy_handler))
        .route("/", any(proxy_handler))
        .with_state(state)
}

async fn proxy_handler(State(state): State<ProxyState>, request: Request<Body>) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (mut parts, body) = request.into_parts();

    let uri = match state.target.uri_for(&parts.uri) {
        Ok(uri) => uri,
        Err(e) => return failure(&state, StatusCode::BAD_REQUEST, "invalid request target", &e),
    };

    strip_hop_by_hop(&mut parts.headers);
    // HTTP/2 clients send the host as `:authority`; HTTP/1.1 needs a header.
    if !parts.headers.contains_key(header::HOST) {
        if let Some(host) = parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        {
            parts.headers.insert(header::HOST, host);
        }
    }
    if let Some(ip) = client_ip {
        let forwarded = match parts.headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(previous) => format!("{previous}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }
    parts.uri = uri;
    // The upstream client speaks HTTP/1.1 whatever the client negotiated.
    parts.version = Version::HTTP_11;
    let upstream_request = Request::from_parts(parts, body);

    tracing::debug!(
        upstream = %state.target.authority(),
        uri = %upstream_request.uri(),
        "Forwarding request"
    );

    match tokio::time::timeout(state.settings.timeout, state.client.request(upstream_request)).await {
        Ok(Ok(response)) => downstream(response),
        Ok(Err(e)) => {
            tracing::error!(upstream = %state.target.authority(), error = %e, "Upstream error");
            failure(&state, StatusCode::BAD_GATEWAY, "upstream request failed", &e)
        }
        Err(_) => {
            tracing::error!(
                upstream = %state.target.authority(),
                timeout = ?state.settings.timeout,
                "Upstream timed out"
            );
            failure(
                &state,
                StatusCode::GATEWAY_TIMEOUT,
                "upstream timed out",
                &format!("no response within {:?}", state.settings.timeout),
            )
        }
    }
}

/// Upstream response with connection-level headers removed; the body
/// streams through.
fn downstream(response: hyper::Response<Incoming>) -> Response {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers.keys().filter(|name| is_hop_by_hop(name)).cloned().collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

fn failure(
    state: &ProxyState,
    status: StatusCode,
    summary: &str,
    detail: &dyn std::fmt::Display,
) -> Response {
    if state.settings.verbose_errors {
        let body = format!(
            "{summary}\nupstream: {}\nerror: {detail}\n",
            state.target.authority()
        );
        (status, body).into_response()
    } else {
        (status, format!("{summary}\n")).into_response()
    }
}
