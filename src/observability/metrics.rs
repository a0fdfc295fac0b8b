//! Metrics collection and exposition.
//!
//! # Metrics
//! - `hx_requests_total` (counter): requests by status class
//! - `hx_request_duration_seconds` (histogram): time spent in the worker
//! - `hx_cache_lookups_total` (counter): lookups by result (hit/miss/bypass)
//! - `hx_cache_stores_total`, `hx_cache_purges_total` (counters)
//! - `hx_cache_errors_total` (counter): global cache failures by operation
//! - `hx_workers_running` (gauge): workers in the `Running` state
//! - `hx_worker_crashes_total` (counter)
//! - `hx_reloads_total` (counter): reloads by outcome
//!
//! Recording without an installed exporter is a no-op, so workers record
//! freely; only the supervising process exposes an endpoint.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint. Must run inside the runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(status: u16, start: Instant) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!("hx_requests_total", "status" => class).increment(1);
    histogram!("hx_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_cache_lookup(result: &'static str) {
    counter!("hx_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_store() {
    counter!("hx_cache_stores_total").increment(1);
}

pub fn record_cache_purge() {
    counter!("hx_cache_purges_total").increment(1);
}

pub fn record_cache_error(operation: &'static str) {
    counter!("hx_cache_errors_total", "operation" => operation).increment(1);
}

pub fn set_workers_running(count: usize) {
    gauge!("hx_workers_running").set(count as f64);
}

pub fn record_worker_crash() {
    counter!("hx_worker_crashes_total").increment(1);
}

pub fn record_reload(outcome: &'static str) {
    counter!("hx_reloads_total", "outcome" => outcome).increment(1);
}
