//! Per-worker HTTP server.
//!
//! # Responsibilities
//! - Wrap the hosted application in the serving middleware stack
//! - Serve HTTP/1.1 and HTTP/2 on every listener the worker holds, TLS on
//!   the HTTPS one
//! - Report readiness once every listener is accepting
//! - Drain gracefully: stop accepting, let in-flight requests finish, then
//!   cut what is left after the grace period

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::{cache_middleware, CacheHandle, CacheLayerState, CacheSettings};
use crate::config::ServingConfig;
use crate::error::ServeError;
use crate::net::{ListenerBinding, ListenerSet, Protocol};
use crate::observability::metrics;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Response header naming the process that served the request.
pub const X_SERVED_BY: &str = "x-served-by";

/// Builds the hosted application; called once per worker.
pub type AppFactory = Arc<dyn Fn() -> Router + Send + Sync>;

/// An application wrapped for serving, plus the listeners it will serve on.
pub struct WorkerServer {
    router: Router,
    bindings: Vec<ListenerBinding>,
}

impl WorkerServer {
    pub fn new(
        config: &ServingConfig,
        app: Router,
        cache: Option<CacheHandle>,
        listeners: ListenerSet,
    ) -> Self {
        Self {
            router: Self::build_router(config, app, cache),
            bindings: listeners.into_bindings(),
        }
    }

    /// Build the middleware stack around the application.
    ///
    /// Outermost first: request id, `x-served-by`, trace, request id
    /// propagation, metrics, timeout, cache, application.
    #[allow(deprecated)]
    fn build_router(config: &ServingConfig, app: Router, cache: Option<CacheHandle>) -> Router {
        let app = match cache {
            Some(store) => {
                let state = CacheLayerState::new(store, CacheSettings::from_config(&config.cache));
                app.layer(middleware::from_fn_with_state(state, cache_middleware))
            }
            None => app,
        };

        let request_id = HeaderName::from_static(X_REQUEST_ID);
        let served_by = HeaderValue::from(std::process::id());

        app.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(SetResponseHeaderLayer::overriding(
                    HeaderName::from_static(X_SERVED_BY),
                    served_by,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(middleware::from_fn(record_metrics))
                .layer(TimeoutLayer::new(config.request_timeout())),
        )
    }

    /// Spawn one server task per listener.
    pub fn start(self) -> Result<RunningServer, ServeError> {
        let mut handles = Vec::with_capacity(self.bindings.len());
        let mut tasks = Vec::with_capacity(self.bindings.len());

        for binding in self.bindings {
            let protocol = binding.protocol();
            let address = binding.local_addr()?;
            let (socket, tls) = binding.into_parts();
            socket.set_nonblocking(true)?;

            let handle = axum_server::Handle::new();
            let service = self
                .router
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>();

            let task = match (protocol, tls) {
                (Protocol::Https, Some(tls)) => {
                    let server = axum_server::from_tcp_rustls(socket, tls).handle(handle.clone());
                    tokio::spawn(async move { server.serve(service).await })
                }
                _ => {
                    let server = axum_server::from_tcp(socket).handle(handle.clone());
                    tokio::spawn(async move { server.serve(service).await })
                }
            };

            tracing::debug!(protocol = %protocol, address = %address, "Serving listener");
            handles.push(handle);
            tasks.push(task);
        }

        Ok(RunningServer {
            control: ServerControl { handles },
            tasks,
        })
    }
}

async fn record_metrics(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;
    metrics::record_request(response.status().as_u16(), start);
    response
}

/// Cloneable remote control over a running server.
#[derive(Clone)]
pub struct ServerControl {
    handles: Vec<axum_server::Handle>,
}

impl ServerControl {
    /// Stop accepting; in-flight connections get `grace` before being cut.
    pub fn drain(&self, grace: Duration) {
        for handle in &self.handles {
            handle.graceful_shutdown(Some(grace));
        }
    }

    /// Close everything now.
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.shutdown();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.handles.iter().map(|h| h.connection_count()).sum()
    }
}

/// Server tasks of one worker.
pub struct RunningServer {
    control: ServerControl,
    tasks: Vec<JoinHandle<std::io::Result<()>>>,
}

impl RunningServer {
    /// Wait until every listener is accepting; returns the bound addresses.
    pub async fn ready(&self) -> Result<Vec<SocketAddr>, ServeError> {
        let addresses = join_all(self.control.handles.iter().map(|h| h.listening())).await;
        addresses
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| ServeError::WorkerStartup("listener failed to start".to_string()))
    }

    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// Resolve when every server task has ended (after a drain or a failure).
    pub async fn wait(self) -> Result<(), ServeError> {
        let mut result = Ok(());
        for task in join_all(self.tasks).await {
            match task {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(ServeError::Io(e)),
                Err(e) => {
                    result = Err(ServeError::Io(std::io::Error::other(e.to_string())));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    fn ephemeral() -> ServingConfig {
        ServingConfig {
            http_port: Some(0),
            bind_host: "127.0.0.1".into(),
            ..ServingConfig::default()
        }
    }

    #[tokio::test]
    async fn serves_app_with_identity_headers() {
        let config = ephemeral();
        let listeners = ListenerSet::bind(&config).unwrap();
        let app = Router::new().route("/", get(|| async { "hello" }));

        let running = WorkerServer::new(&config, app, None, listeners).start().unwrap();
        let addresses = running.ready().await.unwrap();

        let response = reqwest::get(format!("http://{}/", addresses[0])).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()[X_SERVED_BY].to_str().unwrap(),
            std::process::id().to_string()
        );
        assert!(response.headers().contains_key(X_REQUEST_ID));
        assert!(response.headers().get("x-cache").is_none());
        assert_eq!(response.text().await.unwrap(), "hello");

        running.control().drain(Duration::from_millis(100));
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn serves_https_with_h2() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = crate::net::tls::write_test_material(dir.path());
        let config = ServingConfig {
            http_port: None,
            https_port: Some(0),
            tls_cert_path: Some(cert),
            tls_key_path: Some(key),
            ..ephemeral()
        };
        let listeners = ListenerSet::bind(&config).unwrap();
        let port = listeners.local_addr(Protocol::Https).unwrap().port();
        let app = Router::new().route("/", get(|| async { "secure" }));

        let running = WorkerServer::new(&config, app, None, listeners).start().unwrap();
        running.ready().await.unwrap();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let response = client
            .get(format!("https://localhost:{port}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.version(), reqwest::Version::HTTP_2);
        assert!(response.headers().contains_key(X_SERVED_BY));
        assert_eq!(response.text().await.unwrap(), "secure");

        running.control().drain(Duration::from_millis(100));
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn drain_stops_accepting() {
        let config = ephemeral();
        let listeners = ListenerSet::bind(&config).unwrap();
        let addr = listeners.local_addr(Protocol::Http).unwrap();
        let app = Router::new().route("/", get(|| async { "ok" }));

        let running = WorkerServer::new(&config, app, None, listeners).start().unwrap();
        running.ready().await.unwrap();
        let control = running.control();
        control.drain(Duration::from_millis(100));
        running.wait().await.unwrap();
        assert_eq!(control.connection_count(), 0);

        // The socket itself was handed to the server and is now closed.
        assert!(reqwest::get(format!("http://{addr}/")).await.is_err());
    }
}
