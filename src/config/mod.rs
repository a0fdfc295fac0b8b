//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! argv
//!     → cli.rs (clap flags)
//!     → loader.rs (optional TOML file, parsed first)
//!     → flags overlaid on the file
//!     → validation.rs (semantic checks, all errors at once)
//!     → ServingConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! worker (--fd) → HX_WORKER_CONFIG (supervisor's resolved config, JSON)
//!     → validation.rs → ServingConfig
//! ```
//!
//! # Design Decisions
//! - Config is immutable once built; a reload restarts workers, it does not
//!   re-read configuration
//! - All fields have defaults to allow running with no flags at all
//! - Validation separates syntactic (serde/clap) from semantic checks

pub mod cli;
pub mod fds;
pub mod loader;
pub mod schema;
pub mod validation;

pub use cli::{Cli, WORKER_CONFIG_ENV};
pub use fds::FdMap;
pub use loader::ConfigError;
pub use schema::{
    CacheConfig, DaemonConfig, ObservabilityConfig, PoolConfig, ReloadConfig, Role,
    ServingConfig, UpstreamConfig,
};
pub use validation::{validate_config, ValidationError};
