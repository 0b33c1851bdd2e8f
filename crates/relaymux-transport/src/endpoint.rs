//! Interned remote endpoints.
//!
//! Endpoints are immutable, so one shared `Arc<Endpoint>` per address is
//! enough no matter how many sessions or dial attempts refer to it. The cache
//! is an explicit value that callers create and inject; nothing here is
//! global.

use crate::transport::{TransportError, TransportResult};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// An immutable remote transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    /// Socket address of the endpoint
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Concurrent cache mapping socket addresses to shared [`Endpoint`]s.
///
/// With a capacity bound, addresses seen after the cache is full still get
/// an `Endpoint`, it is simply not retained.
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: DashMap<SocketAddr, Arc<Endpoint>>,
    capacity: Option<usize>,
}

impl EndpointCache {
    /// Create an unbounded cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache that retains at most `capacity` endpoints
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            capacity: Some(capacity),
        }
    }

    /// Get the shared endpoint for `addr`, creating it on first use
    pub fn endpoint(&self, addr: SocketAddr) -> Arc<Endpoint> {
        if let Some(existing) = self.entries.get(&addr) {
            return existing.value().clone();
        }

        let endpoint = Arc::new(Endpoint { addr });
        if self
            .capacity
            .is_some_and(|capacity| self.entries.len() >= capacity)
        {
            return endpoint;
        }

        self.entries.entry(addr).or_insert(endpoint).value().clone()
    }

    /// Parse a literal `ip:port` string into a shared endpoint.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` if `s` is not a socket address
    pub fn parse(&self, s: &str) -> TransportResult<Arc<Endpoint>> {
        s.parse::<SocketAddr>()
            .map(|addr| self.endpoint(addr))
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))
    }

    /// Resolve `host:port` (literal or DNS name) into a shared endpoint.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidAddress` if resolution yields nothing
    pub async fn resolve(&self, s: &str) -> TransportResult<Arc<Endpoint>> {
        if let Ok(endpoint) = self.parse(s) {
            return Ok(endpoint);
        }

        let mut addrs = tokio::net::lookup_host(s)
            .await
            .map_err(|e| TransportError::InvalidAddress(format!("{s}: {e}")))?;
        addrs
            .next()
            .map(|addr| self.endpoint(addr))
            .ok_or_else(|| TransportError::InvalidAddress(format!("{s}: no addresses")))
    }

    /// Number of retained endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no endpoints are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every retained endpoint
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_is_shared() {
        let cache = EndpointCache::new();
        let addr: SocketAddr = "10.0.0.1:3478".parse().unwrap();

        let first = cache.endpoint(addr);
        let second = cache.endpoint(addr);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.addr(), addr);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_bounded_cache_stops_retaining() {
        let cache = EndpointCache::with_capacity(2);
        for port in 1000..1005 {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            assert_eq!(cache.endpoint(addr).addr(), addr);
        }
        assert_eq!(cache.len(), 2);

        // Retained entries are still shared
        let retained = SocketAddr::from(([127, 0, 0, 1], 1000));
        assert!(Arc::ptr_eq(
            &cache.endpoint(retained),
            &cache.endpoint(retained)
        ));
    }

    #[test]
    fn test_parse() {
        let cache = EndpointCache::new();
        let endpoint = cache.parse("[::1]:51820").unwrap();
        assert_eq!(endpoint.to_string(), "[::1]:51820");

        assert!(matches!(
            cache.parse("localhost"),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_hostname() {
        let cache = EndpointCache::new();
        let endpoint = cache.resolve("localhost:4000").await.unwrap();
        assert_eq!(endpoint.addr().port(), 4000);
        assert!(endpoint.addr().ip().is_loopback());
    }

    #[test]
    fn test_clear() {
        let cache = EndpointCache::new();
        cache.parse("127.0.0.1:1").unwrap();
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
    }
}
