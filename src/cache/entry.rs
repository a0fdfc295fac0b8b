//! Cache keys, stored responses and the rules deciding what may be stored.

use std::fmt;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Headers that describe one connection and must not be replayed.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Hex-encoded SHA-256 identifying a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash method, full URI, `Host` and the listed vary headers.
    ///
    /// Fields are length-prefixed so adjacent values cannot run together.
    pub fn of_parts(method: &Method, uri: &Uri, headers: &HeaderMap, vary: &[String]) -> Self {
        let mut hasher = Sha256::new();
        let mut feed = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };

        feed(method.as_str().as_bytes());
        feed(uri.to_string().as_bytes());
        let host = headers
            .get(header::HOST)
            .map(HeaderValue::as_bytes)
            .or_else(|| uri.authority().map(|a| a.as_str().as_bytes()))
            .unwrap_or_default();
        feed(host);

        for name in vary {
            feed(name.as_bytes());
            for value in headers.get_all(name.as_str()) {
                feed(value.as_bytes());
            }
        }

        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Accept a fingerprint received over the wire.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Fingerprint(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response as it is kept in the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    /// Keep the end-to-end headers of a response.
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Immutable cache record, shared by `Arc`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response: CachedResponse,
    pub stored_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, response: CachedResponse, ttl: Duration) -> Self {
        let stored_at = Instant::now();
        Self {
            fingerprint,
            response,
            stored_at,
            expires_at: stored_at + ttl,
        }
    }

    /// Rebuild an entry received from another process, keeping its age.
    pub fn restore(
        fingerprint: Fingerprint,
        response: CachedResponse,
        age: Duration,
        remaining: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            fingerprint,
            response,
            stored_at: now.checked_sub(age).unwrap_or(now),
            expires_at: now + remaining,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

fn directives(headers: &HeaderMap) -> impl Iterator<Item = (String, Option<String>)> + '_ {
    headers
        .get_all(header::CACHE_CONTROL)
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| {
            let d = d.trim();
            match d.split_once('=') {
                Some((k, v)) => (
                    k.trim().to_ascii_lowercase(),
                    Some(v.trim().trim_matches('"').to_string()),
                ),
                None => (d.to_ascii_lowercase(), None),
            }
        })
}

/// Whether the client asked to skip the cached copy.
pub fn request_bypasses_cache(headers: &HeaderMap) -> bool {
    let pragma = headers
        .get(header::PRAGMA)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no-cache"));
    pragma || directives(headers).any(|(k, _)| k == "no-cache" || k == "no-store")
}

/// Time to keep a response, or `None` if it must not be stored.
pub fn response_ttl(status: StatusCode, headers: &HeaderMap, default_ttl: Duration) -> Option<Duration> {
    if status != StatusCode::OK || headers.contains_key(header::SET_COOKIE) {
        return None;
    }

    let mut max_age = None;
    let mut s_maxage = None;
    for (key, value) in directives(headers) {
        match key.as_str() {
            "no-store" | "no-cache" | "private" => return None,
            "max-age" => max_age = value.and_then(|v| v.parse::<u64>().ok()),
            "s-maxage" => s_maxage = value.and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
    }

    match s_maxage.or(max_age) {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => Some(default_ttl),
    }
}
