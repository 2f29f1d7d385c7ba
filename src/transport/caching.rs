//! Prefix-dispatching response cache
//!
//! `mount(prefix, ttl)` registers a caching policy for every URL starting with
//! `prefix`. On `send`, the longest mounted prefix matching the URL decides
//! the TTL; equal-length prefixes resolve to the one mounted first. Requests
//! to unmounted URLs always go to the wrapped transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{HttpRequest, HttpResponse, Method, Transport};
use crate::Result;
use crate::cache::{CacheStatsSnapshot, TtlLruCache};

/// Identity of a cacheable request: method, URL, and a digest of headers
/// and body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    /// Method
    pub method: Method,
    /// Full URL
    pub url: String,
    /// [`HttpRequest::content_digest`]
    pub digest: String,
}

impl From<&HttpRequest> for RequestKey {
    fn from(request: &HttpRequest) -> Self {
        Self {
            method: request.method,
            url: request.url.clone(),
            digest: request.content_digest(),
        }
    }
}

/// A mounted prefix and its TTL
#[derive(Debug, Clone)]
struct Mount {
    prefix: String,
    ttl: Duration,
}

/// Transport wrapper that caches responses for mounted URL prefixes
pub struct CachingTransport {
    inner: Arc<dyn Transport>,
    mounts: RwLock<Vec<Mount>>,
    cache: TtlLruCache<RequestKey, HttpResponse>,
}

impl CachingTransport {
    /// Wrap `inner`, caching at most `max_entries` responses
    #[must_use]
    pub fn new(inner: Arc<dyn Transport>, max_entries: usize) -> Self {
        Self {
            inner,
            mounts: RwLock::new(Vec::new()),
            cache: TtlLruCache::new(max_entries),
        }
    }

    /// Cache responses for URLs starting with `prefix` for `ttl`.
    ///
    /// Mounting an already-mounted prefix replaces its TTL.
    pub fn mount(&self, prefix: impl Into<String>, ttl: Duration) {
        let prefix = prefix.into();
        let mut mounts = self.mounts.write();
        if let Some(existing) = mounts.iter_mut().find(|m| m.prefix == prefix) {
            existing.ttl = ttl;
            return;
        }
        debug!(prefix = %prefix, ttl_secs = ttl.as_secs(), "Mounted response cache");
        mounts.push(Mount { prefix, ttl });
    }

    /// TTL of the longest mounted prefix of `url`, if any
    pub fn policy_for(&self, url: &str) -> Option<Duration> {
        let mounts = self.mounts.read();
        let mut best: Option<&Mount> = None;
        for mount in mounts.iter() {
            if !url.starts_with(&mount.prefix) {
                continue;
            }
            if best.is_none_or(|b| mount.prefix.len() > b.prefix.len()) {
                best = Some(mount);
            }
        }
        best.map(|m| m.ttl)
    }

    /// Mounted prefixes in registration order
    pub fn mounted_prefixes(&self) -> Vec<String> {
        self.mounts.read().iter().map(|m| m.prefix.clone()).collect()
    }

    /// Response cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    /// Drop all cached responses (mounts stay)
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[async_trait]
impl Transport for CachingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let Some(ttl) = self.policy_for(&request.url) else {
            return self.inner.send(request).await;
        };

        let key = RequestKey::from(&request);
        let inner = Arc::clone(&self.inner);
        self.cache
            .get_or_try_compute(key, Some(ttl), || async move { inner.send(request).await })
            .await
    }
}
