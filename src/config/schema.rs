//! Configuration schema definitions.
//!
//! This module defines the complete configuration record for the serving
//! core. All types derive Serde traits so the optional TOML file can fill
//! any section; the CLI layer overlays its flags afterwards.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheMode;
use crate::config::fds::FdMap;
use crate::net::Protocol;

/// Default plaintext HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8000;

/// Default port of the shared cache server.
pub const DEFAULT_CACHE_PORT: u16 = 8080;

/// Immutable snapshot of every serving parameter.
///
/// Built once at startup and shared as `Arc<ServingConfig>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServingConfig {
    /// Plaintext HTTP port.
    pub http_port: Option<u16>,

    /// TLS port; requires both `tls_key_path` and `tls_cert_path`.
    pub https_port: Option<u16>,

    /// Port of the shared cache server (only bound with `global_cache`).
    pub cache_port: Option<u16>,

    /// Number of worker processes. 0 serves from the supervising process.
    pub worker_count: usize,

    /// One cache server shared by every worker.
    pub global_cache: bool,

    /// Disable the page cache entirely.
    pub nocache: bool,

    /// PEM private key for HTTPS.
    pub tls_key_path: Option<PathBuf>,

    /// PEM certificate chain for HTTPS.
    pub tls_cert_path: Option<PathBuf>,

    /// Listener descriptors inherited from a supervisor. Never read from a
    /// file; only set on re-executed worker processes.
    #[serde(skip)]
    pub inherited_fds: Option<FdMap>,

    /// Detach from the controlling terminal.
    pub daemonize: bool,

    /// Single-process development mode with verbose errors.
    pub dev_mode: bool,

    /// Restart workers when the watched tree changes.
    pub reload_enabled: bool,

    /// Show warnings and debug output.
    pub loud: bool,

    /// Overrides the hosted application's upstream address.
    pub app_override: Option<String>,

    /// Interface the listeners bind to.
    pub bind_host: String,

    /// Per-request timeout applied around the application, in seconds.
    pub request_timeout_secs: u64,

    pub cache: CacheConfig,
    pub pool: PoolConfig,
    pub reload: ReloadConfig,
    pub upstream: UpstreamConfig,
    pub observability: ObservabilityConfig,
    pub daemon: DaemonConfig,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            http_port: Some(DEFAULT_HTTP_PORT),
            https_port: None,
            cache_port: Some(DEFAULT_CACHE_PORT),
            worker_count: 0,
            global_cache: false,
            nocache: false,
            tls_key_path: None,
            tls_cert_path: None,
            inherited_fds: None,
            daemonize: false,
            dev_mode: false,
            reload_enabled: false,
            loud: false,
            app_override: None,
            bind_host: "0.0.0.0".to_string(),
            request_timeout_secs: 60,
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            reload: ReloadConfig::default(),
            upstream: UpstreamConfig::default(),
            observability: ObservabilityConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

/// What a process does with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Re-executed child serving inherited descriptors.
    Worker,
    /// Single in-process server, no supervisor.
    Dev,
    /// Owns the listeners and the worker pool.
    Supervisor,
}

impl ServingConfig {
    /// Role derived from the inherited descriptors and the dev flag.
    pub fn role(&self) -> Role {
        if self.inherited_fds.is_some() {
            Role::Worker
        } else if self.dev_mode {
            Role::Dev
        } else {
            Role::Supervisor
        }
    }

    pub fn cache_mode(&self) -> CacheMode {
        if self.nocache {
            CacheMode::Disabled
        } else if self.global_cache {
            CacheMode::Global
        } else {
            CacheMode::Local
        }
    }

    /// Ports served to clients by every worker.
    pub fn served_ports(&self) -> Vec<(Protocol, u16)> {
        let mut ports = Vec::with_capacity(2);
        if let Some(port) = self.http_port {
            ports.push((Protocol::Http, port));
        }
        if let Some(port) = self.https_port {
            ports.push((Protocol::Https, port));
        }
        ports
    }

    /// Every port the supervising process binds.
    pub fn bound_ports(&self) -> Vec<(Protocol, u16)> {
        let mut ports = self.served_ports();
        if self.cache_mode() == CacheMode::Global {
            if let Some(port) = self.cache_port {
                ports.push((Protocol::Cache, port));
            }
        }
        ports
    }

    /// Address the hosted application is reached at.
    pub fn upstream_address(&self) -> &str {
        self.app_override.as_deref().unwrap_or(&self.upstream.address)
    }

    /// Loopback-reachable host for the global cache server.
    pub fn cache_host(&self) -> IpAddr {
        match self.bind_host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip,
            _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Page cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when the response carries no max-age.
    pub ttl_secs: u64,

    /// Capacity limit; unbounded when absent.
    pub max_entries: Option<usize>,

    /// Largest response body that is stored.
    pub max_body_bytes: usize,

    /// Request headers folded into the fingerprint.
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_entries: None,
            max_body_bytes: 1024 * 1024,
            vary_headers: vec![
                "accept".to_string(),
                "accept-encoding".to_string(),
                "accept-language".to_string(),
                "cookie".to_string(),
                "authorization".to_string(),
            ],
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Worker pool timing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Time a draining worker gets before it is killed.
    pub drain_grace_secs: u64,

    /// Time a new generation gets to report ready.
    pub startup_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            drain_grace_secs: 30,
            startup_timeout_secs: 15,
        }
    }
}

impl PoolConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Change watcher settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Roots watched recursively.
    pub watch_paths: Vec<PathBuf>,

    /// Path components or `*suffix` / `prefix*` file-name patterns to skip.
    pub ignore: Vec<String>,

    /// Quiet period that coalesces a burst of changes into one reload.
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            watch_paths: vec![PathBuf::from(".")],
            ignore: vec![
                ".git".to_string(),
                "target".to_string(),
                "__pycache__".to_string(),
                "*.pyc".to_string(),
                "*.swp".to_string(),
                "*~".to_string(),
            ],
            debounce_ms: 500,
        }
    }
}

/// Hosted application settings for the bundled reverse-proxy app.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Upstream application address (e.g., "http://127.0.0.1:8001").
    pub address: String,

    /// Upstream response timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8001".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,

    /// Prometheus endpoint bind address for the supervising process.
    pub metrics_address: Option<String>,
}

/// Daemon mode configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// File the daemon writes its pid to.
    pub pid_file: Option<PathBuf>,

    /// Destination of stdout/stderr once detached.
    pub log_file: Option<PathBuf>,
}
