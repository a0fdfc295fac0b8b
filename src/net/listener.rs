//! Listener set: one bound, listening socket per configured port.
//!
//! # Responsibilities
//! - Load TLS material before binding anything
//! - Bind HTTP, HTTPS and (global mode) cache sockets, fail-closed
//! - Rebuild the set from inherited descriptors inside a worker
//! - Export descriptors for inheritance and duplicate them for in-process
//!   workers

use std::fmt;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use axum_server::tls_rustls::RustlsConfig;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, FdMap, ServingConfig};
use crate::error::ServeError;
use crate::net::tls::load_tls_config;

/// What a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Cache,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Cache => "cache",
        })
    }
}

/// Plain description of a binding, safe to copy into worker records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindingInfo {
    pub protocol: Protocol,
    pub port: u16,
    pub fd: RawFd,
}

/// A bound, accepting socket for one protocol/port.
pub struct ListenerBinding {
    protocol: Protocol,
    port: u16,
    socket: TcpListener,
    tls: Option<RustlsConfig>,
}

impl fmt::Debug for ListenerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerBinding")
            .field("protocol", &self.protocol)
            .field("port", &self.port)
            .field("fd", &self.socket.as_raw_fd())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ListenerBinding {
    fn new(protocol: Protocol, port: u16, socket: TcpListener, tls: Option<RustlsConfig>) -> Self {
        Self {
            protocol,
            port,
            socket,
            tls,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Port the socket is bound to; never 0 for a bound listener.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn tls(&self) -> Option<&RustlsConfig> {
        self.tls.as_ref()
    }

    pub fn info(&self) -> BindingInfo {
        BindingInfo {
            protocol: self.protocol,
            port: self.port,
            fd: self.raw_fd(),
        }
    }

    /// Duplicate the descriptor; both copies accept from the same socket.
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            protocol: self.protocol,
            port: self.port,
            socket: self.socket.try_clone()?,
            tls: self.tls.clone(),
        })
    }

    /// Hand the socket (and TLS context) to a server.
    pub fn into_parts(self) -> (TcpListener, Option<RustlsConfig>) {
        (self.socket, self.tls)
    }
}

/// Every listener of one process.
#[derive(Debug, Default)]
pub struct ListenerSet {
    bindings: Vec<ListenerBinding>,
}

impl ListenerSet {
    /// Bind every port the configuration asks for.
    ///
    /// TLS material is loaded first so an unusable key or certificate is a
    /// configuration error raised before any socket exists. A bind failure
    /// drops the sockets bound so far.
    pub fn bind(config: &ServingConfig) -> Result<Self, ServeError> {
        let tls = load_tls(config)?;

        let mut bindings = Vec::new();
        for (protocol, port) in config.bound_ports() {
            let socket = TcpListener::bind((config.bind_host.as_str(), port)).map_err(|source| {
                ServeError::Bind {
                    protocol,
                    port,
                    source,
                }
            })?;
            let local_addr = socket.local_addr()?;
            tracing::info!(
                protocol = %protocol,
                address = %local_addr,
                fd = socket.as_raw_fd(),
                "Listener bound"
            );
            let tls = if protocol == Protocol::Https { tls.clone() } else { None };
            bindings.push(ListenerBinding::new(protocol, local_addr.port(), socket, tls));
        }

        Ok(Self { bindings })
    }

    /// `config` with every port replaced by the port actually bound, so
    /// ephemeral (0) ports resolve before workers or cache clients see them.
    pub fn pinned(&self, config: &ServingConfig) -> ServingConfig {
        let mut pinned = config.clone();
        for binding in &self.bindings {
            let port = Some(binding.port);
            match binding.protocol {
                Protocol::Http => pinned.http_port = port,
                Protocol::Https => pinned.https_port = port,
                Protocol::Cache => pinned.cache_port = port,
            }
        }
        pinned
    }

    /// Rebuild the served listeners from descriptors inherited from a
    /// supervisor. The set takes ownership of the descriptors.
    pub fn adopt(config: &ServingConfig, fds: &FdMap) -> Result<Self, ServeError> {
        let tls = load_tls(config)?;

        let mut bindings = Vec::new();
        for (protocol, port) in config.served_ports() {
            let fd = fds.get(port).ok_or_else(|| {
                ConfigError::InheritedFd {
                    port,
                    fd: -1,
                    reason: "no descriptor passed for this port".to_string(),
                }
            })?;
            if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
                return Err(ConfigError::InheritedFd {
                    port,
                    fd,
                    reason: std::io::Error::last_os_error().to_string(),
                }
                .into());
            }
            // The descriptor is open and handed to us exclusively by the
            // supervisor; nothing else in this process refers to it.
            let socket = unsafe { TcpListener::from_raw_fd(fd) };
            let local_addr = socket.local_addr().map_err(|e| ConfigError::InheritedFd {
                port,
                fd,
                reason: e.to_string(),
            })?;
            tracing::debug!(
                protocol = %protocol,
                address = %local_addr,
                fd,
                "Adopted inherited listener"
            );
            let tls = if protocol == Protocol::Https { tls.clone() } else { None };
            bindings.push(ListenerBinding::new(protocol, port, socket, tls));
        }

        Ok(Self { bindings })
    }

    pub fn bindings(&self) -> &[ListenerBinding] {
        &self.bindings
    }

    pub fn into_bindings(self) -> Vec<ListenerBinding> {
        self.bindings
    }

    pub fn get(&self, protocol: Protocol) -> Option<&ListenerBinding> {
        self.bindings.iter().find(|b| b.protocol == protocol)
    }

    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.get(protocol).and_then(|b| b.local_addr().ok())
    }

    /// Remove and return the cache-server listener, if bound.
    pub fn take_cache(&mut self) -> Option<ListenerBinding> {
        let index = self
            .bindings
            .iter()
            .position(|b| b.protocol == Protocol::Cache)?;
        Some(self.bindings.remove(index))
    }

    fn served(&self) -> impl Iterator<Item = &ListenerBinding> {
        self.bindings.iter().filter(|b| b.protocol != Protocol::Cache)
    }

    /// Descriptors of the client-facing listeners, keyed by bound port.
    pub fn fd_map(&self) -> FdMap {
        let mut map = FdMap::new();
        for binding in self.served() {
            map.insert(binding.port, binding.raw_fd());
        }
        map
    }

    pub fn infos(&self) -> Vec<BindingInfo> {
        self.served().map(ListenerBinding::info).collect()
    }

    /// Duplicate the client-facing listeners for an in-process worker.
    pub fn try_clone_served(&self) -> std::io::Result<ListenerSet> {
        let bindings = self
            .served()
            .map(ListenerBinding::try_clone)
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(ListenerSet { bindings })
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

fn load_tls(config: &ServingConfig) -> Result<Option<RustlsConfig>, ConfigError> {
    if config.https_port.is_none() {
        return Ok(None);
    }
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => load_tls_config(cert, key).map(Some),
        _ => Err(ConfigError::Tls(
            "--https_port requires both --key and --cert".to_string(),
        )),
    }
}
