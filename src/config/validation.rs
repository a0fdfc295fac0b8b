//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde and clap handle syntactic)
//! - Mutually exclusive options and incomplete TLS material
//! - Port conflicts and inherited descriptor coverage
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServingConfig → Result<(), Vec<ValidationError>>
//! - Runs before any socket is bound

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::ServingConfig;
use crate::http::upstream::UpstreamTarget;
use crate::net::Protocol;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("--global_cache and --nocache are mutually exclusive")]
    CacheModeConflict,

    #[error("--https_port requires --key and --cert (missing: {missing})")]
    IncompleteTls { missing: &'static str },

    #[error("no serving port configured (set --http_port or --https_port)")]
    NoServingPort,

    #[error("port {port} is configured for both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: Protocol,
        second: Protocol,
    },

    #[error("--global_cache requires --cache_port")]
    GlobalCacheWithoutPort,

    #[error("cache TTL must be greater than zero")]
    ZeroCacheTtl,

    #[error("inherited descriptors do not cover {protocol} port {port}")]
    InheritedFdMissing { protocol: Protocol, port: u16 },

    #[error("inherited descriptor for port {port} matches no served port")]
    InheritedFdUnexpected { port: u16 },

    #[error("invalid upstream address '{address}': {reason}")]
    InvalidUpstream { address: String, reason: String },
}

/// Check every cross-field invariant of a configuration.
pub fn validate_config(config: &ServingConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.global_cache && config.nocache {
        errors.push(ValidationError::CacheModeConflict);
    }

    if config.https_port.is_some() {
        let missing = match (&config.tls_key_path, &config.tls_cert_path) {
            (None, None) => Some("key and cert"),
            (None, Some(_)) => Some("key"),
            (Some(_), None) => Some("cert"),
            (Some(_), Some(_)) => None,
        };
        if let Some(missing) = missing {
            errors.push(ValidationError::IncompleteTls { missing });
        }
    }

    let served = config.served_ports();
    if served.is_empty() {
        errors.push(ValidationError::NoServingPort);
    }

    if config.global_cache && config.cache_port.is_none() {
        errors.push(ValidationError::GlobalCacheWithoutPort);
    }

    // Port 0 asks the kernel for an ephemeral port and never conflicts.
    let mut seen: Vec<(Protocol, u16)> = Vec::new();
    for (protocol, port) in config.bound_ports() {
        if port != 0 {
            if let Some((first, _)) = seen.iter().find(|(_, p)| *p == port) {
                errors.push(ValidationError::DuplicatePort {
                    port,
                    first: *first,
                    second: protocol,
                });
            }
        }
        seen.push((protocol, port));
    }

    if !config.nocache && config.cache.ttl_secs == 0 {
        errors.push(ValidationError::ZeroCacheTtl);
    }

    if let Some(fds) = &config.inherited_fds {
        let served_ports: HashSet<u16> = served.iter().map(|(_, port)| *port).collect();
        for (protocol, port) in &served {
            if fds.get(*port).is_none() {
                errors.push(ValidationError::InheritedFdMissing {
                    protocol: *protocol,
                    port: *port,
                });
            }
        }
        for port in fds.ports() {
            if !served_ports.contains(&port) {
                errors.push(ValidationError::InheritedFdUnexpected { port });
            }
        }
    }

    if let Err(reason) = UpstreamTarget::parse(config.upstream_address()) {
        errors.push(ValidationError::InvalidUpstream {
            address: config.upstream_address().to_string(),
            reason,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
