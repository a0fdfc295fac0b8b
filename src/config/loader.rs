//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::ServingConfig;
use crate::config::validation::ValidationError;

/// Error type for configuration problems. Always fatal, always reported
/// before any socket is bound.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("TLS material unusable: {0}")]
    Tls(String),

    #[error("configuration handed over by the supervisor is unreadable: {0}")]
    Handoff(#[source] serde_json::Error),

    #[error("inherited descriptor {fd} for port {port} is unusable: {reason}")]
    InheritedFd { port: u16, fd: i32, reason: String },
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse a TOML configuration file. Validation happens once the CLI flags
/// have been overlaid.
pub fn load_config(path: &Path) -> Result<ServingConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
