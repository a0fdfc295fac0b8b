//! In-process cache backed by a concurrent map.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheEntry, CacheStore, Fingerprint};

/// Per-worker cache; also the storage of the global cache server.
#[derive(Debug, Clone, Default)]
pub struct LocalCache {
    entries: Arc<DashMap<Fingerprint, Arc<CacheEntry>>>,
    max_entries: Option<usize>,
}

impl LocalCache {
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries,
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        // Expiry is lazy: drop the entry here instead of in a sweeper task.
        if self
            .entries
            .remove_if(fingerprint, |_, entry| entry.is_expired(now))
            .is_some()
        {
            return None;
        }
        self.entries.get(fingerprint).map(|e| Arc::clone(e.value()))
    }

    pub fn insert(&self, entry: CacheEntry) {
        if let Some(max) = self.max_entries {
            if max == 0 {
                return;
            }
            if !self.entries.contains_key(&entry.fingerprint) && self.entries.len() >= max {
                self.make_room(max);
            }
        }
        self.entries.insert(entry.fingerprint.clone(), Arc::new(entry));
    }

    pub fn remove(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.remove(fingerprint).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sweep expired entries, then evict the ones closest to expiry.
    fn make_room(&self, max: usize) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));

        while self.entries.len() >= max {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.value().expires_at)
                .map(|e| e.key().clone());
            match victim {
                Some(fp) => {
                    self.entries.remove(&fp);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheStore for LocalCache {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<CacheEntry>> {
        self.get(fingerprint)
    }

    async fn store(&self, entry: CacheEntry) {
        self.insert(entry);
    }

    async fn purge(&self, fingerprint: &Fingerprint) -> bool {
        self.remove(fingerprint)
    }

    async fn purge_all(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedResponse;
    use axum::http::{HeaderMap, Method, StatusCode};
    use bytes::Bytes;
    use std::time::Duration;

    fn fp(path: &str) -> Fingerprint {
        Fingerprint::of_parts(&Method::GET, &path.parse().unwrap(), &HeaderMap::new(), &[])
    }

    fn entry(path: &str, ttl: Duration) -> CacheEntry {
        let response = CachedResponse::new(StatusCode::OK, &HeaderMap::new(), Bytes::from("body"));
        CacheEntry::new(fp(path), response, ttl)
    }

    #[test]
    fn stores_and_returns_shared_entry() {
        let cache = LocalCache::new(None);
        cache.insert(entry("/a", Duration::from_secs(60)));
        let first = cache.get(&fp("/a")).unwrap();
        let second = cache.get(&fp("/a")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(cache.get(&fp("/b")).is_none());
    }

    #[test]
    fn expired_entry_is_removed_on_lookup() {
        let cache = LocalCache::new(None);
        cache.insert(entry("/a", Duration::ZERO));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&fp("/a")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_evicts_soonest_to_expire() {
        let cache = LocalCache::new(Some(2));
        cache.insert(entry("/short", Duration::from_secs(10)));
        cache.insert(entry("/long", Duration::from_secs(100)));
        cache.insert(entry("/new", Duration::from_secs(50)));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&fp("/short")).is_none());
        assert!(cache.get(&fp("/long")).is_some());
        assert!(cache.get(&fp("/new")).is_some());
    }

    #[test]
    fn full_cache_prefers_sweeping_expired() {
        let cache = LocalCache::new(Some(2));
        cache.insert(entry("/stale", Duration::ZERO));
        cache.insert(entry("/long", Duration::from_secs(100)));
        cache.insert(entry("/new", Duration::from_secs(1)));

        assert!(cache.get(&fp("/long")).is_some());
        assert!(cache.get(&fp("/new")).is_some());
    }

    #[tokio::test]
    async fn purge_removes_entries() {
        let cache = LocalCache::new(None);
        cache.store(entry("/a", Duration::from_secs(60))).await;
        cache.store(entry("/b", Duration::from_secs(60))).await;

        assert!(cache.purge(&fp("/a")).await);
        assert!(!cache.purge(&fp("/a")).await);
        cache.purge_all().await;
        assert!(cache.lookup(&fp("/b")).await.is_none());
    }
}
