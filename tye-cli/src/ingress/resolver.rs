use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::debug;

#[derive(Debug)]
struct Entry {
    addrs: Vec<SocketAddr>,
    next: AtomicUsize,
}

impl Entry {
    /// All addresses, starting one further along on every call.
    fn rotated(&self) -> Vec<SocketAddr> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.addrs.len();
        let mut out = Vec::with_capacity(self.addrs.len());
        out.extend_from_slice(&self.addrs[start..]);
        out.extend_from_slice(&self.addrs[..start]);
        out
    }
}

/// DNS resolver for the ingress client that spreads connections across every
/// address a host resolves to. Lookups are cached until a connection to the
/// host fails, at which point the entry is evicted and resolved afresh.
#[derive(Clone, Debug, Default)]
pub struct RoundRobinResolver {
    cache: Arc<DashMap<String, Arc<Entry>>>,
}

impl RoundRobinResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lookup(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        let key = host.to_ascii_lowercase();
        if let Some(entry) = self.cache.get(&key).map(|e| e.value().clone()) {
            return Ok(entry.rotated());
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((key.as_str(), 0)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} resolved to no addresses", host),
            ));
        }
        debug!(host = %key, count = addrs.len(), "resolved");
        let entry = self
            .cache
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Entry {
                    addrs,
                    next: AtomicUsize::new(0),
                })
            })
            .value()
            .clone();
        Ok(entry.rotated())
    }

    /// Forget `host` so the next request resolves it again.
    pub fn evict(&self, host: &str) -> bool {
        let evicted = self.cache.remove(&host.to_ascii_lowercase()).is_some();
        if evicted {
            debug!(host, "evicted from resolver cache");
        }
        evicted
    }
}

impl Resolve for RoundRobinResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let addrs = this.lookup(name.as_str()).await?;
            Ok::<Addrs, Box<dyn std::error::Error + Send + Sync>>(Box::new(addrs.into_iter()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(host: &str, addrs: &[&str]) -> RoundRobinResolver {
        let resolver = RoundRobinResolver::new();
        resolver.cache.insert(
            host.to_string(),
            Arc::new(Entry {
                addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
                next: AtomicUsize::new(0),
            }),
        );
        resolver
    }

    #[tokio::test]
    async fn test_lookups_rotate_through_addresses() {
        let resolver = seeded("api.local", &["10.0.0.1:0", "10.0.0.2:0", "10.0.0.3:0"]);
        let mut firsts = Vec::new();
        for _ in 0..4 {
            firsts.push(resolver.lookup("API.local").await.unwrap()[0].to_string());
        }
        assert_eq!(
            firsts,
            vec!["10.0.0.1:0", "10.0.0.2:0", "10.0.0.3:0", "10.0.0.1:0"]
        );
    }

    #[tokio::test]
    async fn test_evict_forces_fresh_resolution() {
        let resolver = seeded("localhost", &["10.9.9.9:0"]);
        assert_eq!(resolver.lookup("localhost").await.unwrap()[0].to_string(), "10.9.9.9:0");

        assert!(resolver.evict("localhost"));
        assert!(!resolver.cache.contains_key("localhost"));
        assert!(!resolver.evict("localhost"));

        let fresh = resolver.lookup("localhost").await.unwrap();
        assert!(fresh.iter().all(|a| a.ip().is_loopback()));
        assert!(resolver.cache.contains_key("localhost"));
    }
}
