//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the `tracing` subscriber once per process
//! - Pick the filter: `RUST_LOG`, then the config file, then mode defaults
//!
//! # Design Decisions
//! - Everything goes to stderr; a worker's stdout is its control channel
//! - Workers inherit the supervisor's stderr, so one stream carries the
//!   whole process tree (redirected to the log file when daemonized)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ServingConfig;

/// Filter used when neither `RUST_LOG` nor `observability.log_filter` is set.
pub fn default_filter(config: &ServingConfig) -> &'static str {
    if config.dev_mode {
        "hx_serve=debug,tower_http=debug"
    } else if config.loud {
        "warn,hx_serve=debug"
    } else {
        "hx_serve=info"
    }
}

fn filter(config: &ServingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directives = config
            .observability
            .log_filter
            .as_deref()
            .unwrap_or_else(|| default_filter(config));
        EnvFilter::try_new(directives).unwrap_or_else(|e| {
            eprintln!("invalid log filter '{directives}': {e}; using defaults");
            EnvFilter::new(default_filter(config))
        })
    })
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(config: &ServingConfig) {
    let _ = tracing_subscriber::registry()
        .with(filter(config))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!config.daemonize),
        )
        .try_init();
}
