//! DNS resolution with a time-bounded cache.
//!
//! This module resolves backend hostnames to IP addresses and caches the
//! results for a bounded TTL:
//! - IP literals (both families) bypass the cache entirely
//! - Concurrent resolutions of one host are deduplicated (single-flight)
//! - Entries can be invalidated explicitly, which the backend pool uses
//!   after a backend's first strike
//! - A background refresher re-resolves every cached host periodically

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Default cache TTL and background refresh interval.
pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(3600);

/// Resolution failure for a single host.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The system resolver returned an error.
    #[error("lookup failed for '{host}': {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// The system resolver returned no addresses.
    #[error("lookup for '{host}' returned no addresses")]
    NoAddresses { host: String },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

/// Cache statistics for the observability surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub ttl_secs: u64,
}

/// DNS resolver with TTL-based caching and single-flight deduplication.
pub struct DnsResolver {
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Per-host resolution barrier. The first caller for a host holds the
    /// host lock across the system lookup; waiters acquire it afterwards and
    /// find the cache populated.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_DNS_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a host to a non-empty, ordered address list.
    ///
    /// IP literals are returned immediately without touching the cache. For
    /// names, a fresh cache entry is served without network I/O; otherwise a
    /// system resolution runs and the result is cached for the TTL.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(vec![ip]);
        }

        if let Some(addrs) = self.cached(host) {
            debug!(host, "dns cache hit");
            return Ok(addrs);
        }

        let host_lock = self.host_lock(host);
        let _guard = host_lock.lock().await;

        // Another caller may have resolved while we waited on the barrier.
        if let Some(addrs) = self.cached(host) {
            debug!(host, "dns cache hit after wait");
            return Ok(addrs);
        }

        let addrs = system_lookup(host).await?;
        info!(host, addrs = ?addrs, "dns resolved");

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            host.to_string(),
            CacheEntry {
                addrs: addrs.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(addrs)
    }

    /// Drop any cache entry for a host. Idempotent.
    pub fn invalidate(&self, host: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.remove(host).is_some() {
            info!(host, "dns cache invalidated");
        }
    }

    /// Re-resolve every cached host. Best-effort: a failed lookup keeps the
    /// previous value unless the entry has already expired.
    pub async fn refresh_all(&self) {
        let hosts: Vec<String> = {
            let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.keys().cloned().collect()
        };

        if hosts.is_empty() {
            return;
        }

        debug!(count = hosts.len(), "refreshing dns cache");

        for host in hosts {
            match system_lookup(&host).await {
                Ok(addrs) => {
                    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    cache.insert(
                        host.clone(),
                        CacheEntry {
                            addrs,
                            expires_at: Instant::now() + self.ttl,
                        },
                    );
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "dns refresh failed, keeping previous value");
                    let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = cache.get(&host) {
                        if entry.expires_at <= Instant::now() {
                            cache.remove(&host);
                        }
                    }
                }
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            entries: cache.len(),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Spawn the periodic cache refresher. The returned handle is aborted on
    /// shutdown; refresh failures are logged and swallowed.
    pub fn spawn_refresher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(resolver.ttl).await;
                resolver.refresh_all().await;
            }
        })
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(host)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.addrs.clone())
    }

    fn host_lock(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a bare or bracketed IP literal.
fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(ip);
    }
    host.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .and_then(|inner| inner.parse::<IpAddr>().ok())
}

async fn system_lookup(host: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let resolved = tokio::net::lookup_host((host, 0u16))
        .await
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?;

    // Preserve resolver order, dropping duplicate addresses across families.
    let mut addrs: Vec<IpAddr> = Vec::new();
    for sockaddr in resolved {
        let ip = sockaddr.ip();
        if !addrs.contains(&ip) {
            addrs.push(ip);
        }
    }

    if addrs.is_empty() {
        return Err(ResolveError::NoAddresses {
            host: host.to_string(),
        });
    }

    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ipv4_literal_bypasses_cache() {
        let resolver = DnsResolver::new();
        let addrs = resolver.resolve("192.0.2.7").await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn ipv6_literal_bypasses_cache() {
        let resolver = DnsResolver::new();
        let addrs = resolver.resolve("2001:db8::1").await.unwrap();
        assert_eq!(addrs, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);

        // Bracketed form is tolerated too.
        let addrs = resolver.resolve("[2001:db8::1]").await.unwrap();
        assert_eq!(addrs, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(resolver.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn resolve_caches_and_invalidate_clears() {
        let resolver = DnsResolver::new();

        let first = resolver.resolve("localhost").await.unwrap();
        assert!(!first.is_empty());
        assert_eq!(resolver.cache_stats().entries, 1);

        // Served from cache, identical result.
        let second = resolver.resolve("localhost").await.unwrap();
        assert_eq!(first, second);

        resolver.invalidate("localhost");
        assert_eq!(resolver.cache_stats().entries, 0);

        // Invalidation is idempotent.
        resolver.invalidate("localhost");
        assert_eq!(resolver.cache_stats().entries, 0);
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let resolver = DnsResolver::with_ttl(Duration::from_millis(10));

        resolver.resolve("localhost").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The entry is past expiry; a fresh resolution must repopulate it.
        let addrs = resolver.resolve("localhost").await.unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(resolver.cache_stats().entries, 1);
    }

    #[tokio::test]
    async fn unresolvable_host_errors() {
        let resolver = DnsResolver::new();
        let err = resolver.resolve("host.invalid").await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Lookup { .. } | ResolveError::NoAddresses { .. }
        ));
        assert_eq!(resolver.cache_stats().entries, 0);
    }
}
