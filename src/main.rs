//! hx: multi-process HTTP/HTTPS serving frontend.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌──────────────────────────────────────────────────┐
//!                    │                   SUPERVISOR                      │
//!                    │                                                   │
//!                    │  ┌──────────┐   ┌───────────┐   ┌─────────────┐  │
//!                    │  │ listener │   │  worker   │◀──│  lifecycle  │◀─┼── SIGHUP / SIGTERM
//!                    │  │   set    │   │   pool    │   │   events    │◀─┼── change watcher
//!                    │  └────┬─────┘   └─────┬─────┘   └─────────────┘  │
//!                    │       │ fds           │ re-exec + --fd           │
//!                    │       │               │                          │
//!                    │  ┌────┴───────────────┴───┐   ┌───────────────┐  │
//!                    │  │   inherited listeners  │   │ cache server  │  │
//!                    │  └────────────┬───────────┘   │ (global mode) │  │
//!                    └───────────────┼───────────────┴───────▲───────┴──┘
//!                                    │                       │ loopback
//!     Client Request   ┌─────────────▼───────────────────────┴───────┐
//!     ─────────────────▶│ WORKER: request id → trace → timeout       │
//!                      │         → cache layer → application ────────┼──▶ Upstream
//!     ◀─────────────────│                                             │
//!     Client Response  └─────────────────────────────────────────────┘
//! ```
//!
//! A worker is this same binary, re-executed with `--fd port:fd,...` and the
//! supervisor's resolved configuration in `HX_WORKER_CONFIG`.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use hx_serve::config::Cli;
use hx_serve::http::upstream::{self, UpstreamSettings, UpstreamTarget};
use hx_serve::http::AppFactory;

fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hx: {e}");
            return ExitCode::from(2);
        }
    };

    let target = match UpstreamTarget::parse(config.upstream_address()) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("hx: invalid application address: {e}");
            return ExitCode::from(2);
        }
    };
    let settings = UpstreamSettings::from_config(&config);
    let app: AppFactory = Arc::new(move || upstream::router(target.clone(), settings.clone()));

    hx_serve::lifecycle::launch(config, app)
}
