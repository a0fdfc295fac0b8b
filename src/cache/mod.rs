//! Page cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request
//!     → layer.rs (fingerprint, PURGE, bypass rules)
//!     → CacheStore::lookup
//!         HIT  → stored response (x-cache: HIT, age)
//!         MISS → application → cacheability check → CacheStore::store
//! ```
//!
//! # Backends
//! - `local.rs`: one concurrent map per worker
//! - `global.rs`: one `CacheServer` in the supervising process; workers talk
//!   to it over loopback HTTP through `GlobalCacheClient`
//!
//! Workers receive the backend as an explicit `CacheHandle`; there is no
//! process-wide cache singleton.

pub mod entry;
pub mod global;
pub mod layer;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServingConfig;

pub use entry::{CacheEntry, CachedResponse, Fingerprint};
pub use global::{CacheServer, GlobalCacheClient};
pub use layer::{cache_middleware, CacheLayerState, CacheSettings};
pub use local::LocalCache;

/// Which cache, if any, sits in front of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Disabled,
    Local,
    Global,
}

/// Storage behind the cache middleware.
///
/// Lookups are async so a global-cache round trip suspends only the request
/// that issued it. Implementations swallow their own transport errors: a
/// failing backend behaves as an empty cache.
#[async_trait]
pub trait CacheStore: Send + Sync + 'static {
    /// Fresh entry for the fingerprint, if any. Expired entries are dropped.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>>;

    async fn store(&self, entry: CacheEntry);

    /// Remove one entry; true if something was removed.
    async fn purge(&self, fingerprint: &Fingerprint) -> bool;

    async fn purge_all(&self);
}

/// Shared handle given to each worker's server.
pub type CacheHandle = Arc<dyn CacheStore>;

/// Build the cache backend a worker should use.
pub fn handle_for(config: &ServingConfig) -> Option<CacheHandle> {
    match config.cache_mode() {
        CacheMode::Disabled => None,
        CacheMode::Local => Some(Arc::new(LocalCache::new(config.cache.max_entries))),
        CacheMode::Global => {
            let port = config.cache_port?;
            Some(Arc::new(GlobalCacheClient::new(config.cache_host(), port)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nocache_has_no_handle() {
        let config = ServingConfig {
            nocache: true,
            ..ServingConfig::default()
        };
        assert!(handle_for(&config).is_none());
        assert!(handle_for(&ServingConfig::default()).is_some());
    }
}
