//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events on stderr)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → terminal, or daemon.log_file once detached
//!     → Metrics endpoint (Prometheus scrape, supervising process only)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through every worker's middleware stack
//! - Metrics are cheap (atomic increments) and no-ops without an exporter

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
