//! Hostname resolution with an in-process cache and round-robin selection.
//!
//! # Responsibilities
//! - Answer IP literals without a lookup
//! - Serve repeat lookups from the cache, rotating across every cached address
//! - Resolve misses over DNS-over-TLS when a resolver is configured
//! - Fall back to the system resolver when DNS-over-TLS fails
//!
//! # Design Decisions
//! - No TTL expiry; entries live as long as the resolver
//! - Concurrent misses for one host are not coalesced; each issues its own query
//!   and the last answer to land replaces the entry

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::tls_socket::DnsOverTlsSocket;
use crate::config::DnsOverTlsConfig;
use crate::error::{ProxyError, Result};
use crate::observability::metrics;

/// Cached addresses for one hostname.
#[derive(Debug)]
pub struct DnsEntry {
    addresses: Vec<IpAddr>,
    resolved_at: Instant,
    counter: AtomicUsize,
}

impl DnsEntry {
    fn new(addresses: Vec<IpAddr>) -> Self {
        Self {
            addresses,
            resolved_at: Instant::now(),
            counter: AtomicUsize::new(0),
        }
    }

    /// Next address in rotation.
    fn next_address(&self) -> Option<IpAddr> {
        if self.addresses.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        Some(self.addresses[index])
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn age(&self) -> Duration {
        self.resolved_at.elapsed()
    }
}

pub struct DnsResolver {
    cache: DashMap<String, Arc<DnsEntry>>,
    tls_socket: Option<DnsOverTlsSocket>,
}

impl DnsResolver {
    /// A resolver that only consults the system resolver.
    pub fn system() -> Self {
        Self {
            cache: DashMap::new(),
            tls_socket: None,
        }
    }

    /// A resolver that tries `settings` over TLS first when given.
    pub fn new(
        settings: Option<DnsOverTlsConfig>,
        tls: Arc<rustls::ClientConfig>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            tls_socket: settings.map(|s| DnsOverTlsSocket::new(s, tls, query_timeout)),
        }
    }

    pub fn uses_dns_over_tls(&self) -> bool {
        self.tls_socket.is_some()
    }

    /// Returns one address for `host`, rotating through cached answers.
    pub async fn lookup_ip(&self, host: &str) -> Result<IpAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        if let Some(entry) = self.cache.get(host).map(|e| Arc::clone(e.value())) {
            if let Some(ip) = entry.next_address() {
                metrics::record_dns_lookup("cache");
                return Ok(ip);
            }
        }

        let addresses = self.resolve(host).await?;
        let entry = Arc::new(DnsEntry::new(addresses));
        let ip = entry
            .next_address()
            .ok_or_else(|| ProxyError::Dns(format!("no addresses for {}", host)))?;
        self.cache.insert(host.to_string(), entry);
        Ok(ip)
    }

    /// Cached entry for a host, if one exists.
    pub fn cached(&self, host: &str) -> Option<Arc<DnsEntry>> {
        self.cache.get(host).map(|e| Arc::clone(e.value()))
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(socket) = &self.tls_socket {
            match socket.lookup_ip(host).await {
                Ok(addresses) if !addresses.is_empty() => {
                    metrics::record_dns_lookup("tls");
                    return Ok(addresses);
                }
                Ok(_) => {
                    tracing::debug!(host, "DNS-over-TLS returned no addresses, using system resolver");
                }
                Err(error) if error.is_canceled() && socket.is_closed() => return Err(error),
                Err(error) => {
                    tracing::debug!(host, %error, "DNS-over-TLS lookup failed, using system resolver");
                }
            }
        }
        self.system_lookup(host).await
    }

    async fn system_lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| ProxyError::Dns(format!("{}: {}", host, e)))?
        {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
        // the rest of the stack connects over IPv4 first
        addresses.sort_by_key(|ip| ip.is_ipv6());
        metrics::record_dns_lookup("system");
        if addresses.is_empty() {
            return Err(ProxyError::Dns(format!("no addresses for {}", host)));
        }
        Ok(addresses)
    }

    /// Cancels pending DNS-over-TLS queries and closes the socket.
    pub async fn close(&self) {
        if let Some(socket) = &self.tls_socket {
            socket.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tls_socket::tests::{client_tls, MockResolver};

    #[tokio::test]
    async fn ip_literals_pass_through() {
        let resolver = DnsResolver::system();
        assert_eq!(
            resolver.lookup_ip("10.1.2.3").await.unwrap(),
            "10.1.2.3".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            resolver.lookup_ip("[::1]").await.unwrap(),
            "::1".parse::<IpAddr>().unwrap()
        );
        assert!(resolver.cached("10.1.2.3").is_none());
    }

    #[tokio::test]
    async fn cached_entries_rotate() {
        let resolver = DnsResolver::system();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        resolver
            .cache
            .insert("multi.test".into(), Arc::new(DnsEntry::new(vec![a, b])));

        assert_eq!(resolver.lookup_ip("multi.test").await.unwrap(), a);
        assert_eq!(resolver.lookup_ip("multi.test").await.unwrap(), b);
        assert_eq!(resolver.lookup_ip("multi.test").await.unwrap(), a);
    }

    #[tokio::test]
    async fn system_lookup_is_cached() {
        let resolver = DnsResolver::system();
        let ip = resolver.lookup_ip("localhost").await.unwrap();
        assert!(ip.is_loopback());
        let entry = resolver.cached("localhost").unwrap();
        assert!(!entry.addresses().is_empty());
        assert!(entry.addresses()[0].is_ipv4() || entry.addresses().iter().all(|a| a.is_ipv6()));
    }

    #[tokio::test]
    async fn dns_over_tls_answers_rotate_from_one_query() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let server = MockResolver::start(vec![a, b], false).await;
        let resolver = DnsResolver::new(Some(server.config.clone()), client_tls(), Duration::from_secs(2));
        assert!(resolver.uses_dns_over_tls());

        assert_eq!(resolver.lookup_ip("multi.example.test").await.unwrap(), a);
        assert_eq!(resolver.lookup_ip("multi.example.test").await.unwrap(), b);
        assert_eq!(resolver.lookup_ip("multi.example.test").await.unwrap(), a);
        assert_eq!(server.queries(), vec!["multi.example.test"]);
        assert_eq!(resolver.cached("multi.example.test").unwrap().addresses(), &[a, b]);
    }

    #[tokio::test]
    async fn unreachable_dns_over_tls_falls_back_to_system() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = DnsOverTlsConfig {
            host: "127.0.0.1".into(),
            port,
            servername: "dns.test".into(),
        };
        let resolver = DnsResolver::new(Some(settings), client_tls(), Duration::from_secs(2));

        let ip = resolver.lookup_ip("localhost").await.unwrap();
        assert!(ip.is_loopback());
        assert!(resolver.cached("localhost").is_some());
    }

    #[tokio::test]
    async fn empty_dns_over_tls_answers_fall_back_to_system() {
        let server = MockResolver::start(Vec::new(), false).await;
        let resolver = DnsResolver::new(Some(server.config.clone()), client_tls(), Duration::from_secs(2));

        assert!(resolver.lookup_ip("localhost").await.unwrap().is_loopback());
        assert_eq!(server.queries(), vec!["localhost"]);
    }

    #[tokio::test]
    async fn closed_resolver_does_not_fall_back() {
        let server = MockResolver::start(vec!["10.0.0.3".parse().unwrap()], false).await;
        let resolver = DnsResolver::new(Some(server.config.clone()), client_tls(), Duration::from_secs(2));
        resolver.close().await;

        let error = resolver.lookup_ip("localhost").await.unwrap_err();
        assert!(error.is_canceled());
    }
}
