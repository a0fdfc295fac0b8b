//! Page cache behaviour through a running server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hx_serve::config::ServingConfig;
use hx_serve::http::upstream::{self, UpstreamSettings, UpstreamTarget};
use hx_serve::http::AppFactory;
use hx_serve::lifecycle::{serve, LifecycleChannel, LifecycleEvent};
use hx_serve::net::{ListenerSet, Protocol};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

mod common;

struct Running {
    addr: SocketAddr,
    events: UnboundedSender<LifecycleEvent>,
    serving: JoinHandle<Result<(), hx_serve::ServeError>>,
}

impl Running {
    async fn stop(self) {
        self.events.send(LifecycleEvent::Shutdown).unwrap();
        self.serving.await.unwrap().unwrap();
    }
}

/// Backend counting its hits; every response carries `cache_control`.
async fn counting_backend(cache_control: &'static str) -> (SocketAddr, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let addr = common::start_programmable_backend("127.0.0.1:0".parse().unwrap(), move || {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            (200, vec![("Cache-Control", cache_control.to_string())], format!("render {n}"))
        }
    })
    .await;
    (addr, hits)
}

async fn start(config: ServingConfig) -> Running {
    let config = Arc::new(config);
    let target = UpstreamTarget::parse(config.upstream_address()).unwrap();
    let settings = UpstreamSettings::from_config(&config);
    let app: AppFactory = Arc::new(move || upstream::router(target.clone(), settings.clone()));

    let listeners = ListenerSet::bind(&config).unwrap();
    let addr = listeners.local_addr(Protocol::Http).unwrap();
    let channel = LifecycleChannel::new();
    let events = channel.sender();
    let serving = tokio::spawn(serve(config, listeners, app, channel));
    assert!(common::wait_for_port(addr, Duration::from_secs(5)).await);
    Running { addr, events, serving }
}

fn local_config(backend: SocketAddr) -> ServingConfig {
    ServingConfig {
        http_port: Some(0),
        bind_host: "127.0.0.1".into(),
        app_override: Some(format!("http://{backend}")),
        ..ServingConfig::default()
    }
}

async fn get(addr: SocketAddr, path: &str) -> (String, String) {
    let response = common::fresh_client()
        .get(format!("http://{addr}{path}"))
        .send()
        .await
        .unwrap();
    let x_cache = response
        .headers()
        .get("x-cache")
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    (x_cache, response.text().await.unwrap())
}

#[tokio::test]
async fn repeated_get_is_served_from_cache_until_expiry() {
    let (backend, hits) = counting_backend("max-age=1").await;
    let running = start(local_config(backend)).await;

    assert_eq!(get(running.addr, "/page").await, ("MISS".into(), "render 1".into()));
    assert_eq!(get(running.addr, "/page").await, ("HIT".into(), "render 1".into()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(get(running.addr, "/page").await, ("MISS".into(), "render 2".into()));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    running.stop().await;
}

#[tokio::test]
async fn no_store_responses_are_not_cached() {
    let (backend, hits) = counting_backend("no-store").await;
    let running = start(local_config(backend)).await;

    get(running.addr, "/").await;
    get(running.addr, "/").await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    running.stop().await;
}

#[tokio::test]
async fn purge_evicts_the_page() {
    let (backend, hits) = counting_backend("max-age=60").await;
    let running = start(local_config(backend)).await;

    get(running.addr, "/article").await;
    assert_eq!(get(running.addr, "/article").await.0, "HIT");

    let purge = common::fresh_client()
        .request(
            reqwest::Method::from_bytes(b"PURGE").unwrap(),
            format!("http://{}/article", running.addr),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(purge.status(), 200);

    assert_eq!(get(running.addr, "/article").await, ("MISS".into(), "render 2".into()));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    running.stop().await;
}

#[tokio::test]
async fn nocache_always_reaches_the_application() {
    let (backend, hits) = counting_backend("max-age=60").await;
    let running = start(ServingConfig {
        nocache: true,
        ..local_config(backend)
    })
    .await;

    assert_eq!(get(running.addr, "/").await.0, "");
    assert_eq!(get(running.addr, "/").await.0, "");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    running.stop().await;
}

#[tokio::test]
async fn global_cache_is_served_by_the_supervisor() {
    let (backend, hits) = counting_backend("max-age=60").await;
    let running = start(ServingConfig {
        global_cache: true,
        cache_port: Some(0),
        ..local_config(backend)
    })
    .await;

    assert_eq!(get(running.addr, "/shared").await.0, "MISS");
    assert_eq!(get(running.addr, "/shared").await, ("HIT".into(), "render 1".into()));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    running.stop().await;
}
