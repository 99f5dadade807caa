//! DNS resolver cache (C2).
//!
//! Grounded on `petrel::resolver_cache` (`original_source/src/core/resolver_cache.h/.cpp`):
//! a `"host:service"`-keyed map of `{expires_at, endpoints}` guarded by a
//! mutex, TTL-evicted on read, with concurrent misses tolerated (the second
//! writer simply overwrites the first). The original drives the underlying
//! `boost::asio::ip::basic_resolver` lookup through a fiber `yield`; here the
//! suspension point is an `.await` on a `tokio::sync::oneshot` receiver fed
//! by a small dedicated Tokio runtime that owns the actual `hickory-resolver`
//! lookup. That runtime exists purely to give the resolver a reactor to run
//! its UDP/TCP sockets on — request-handling tasks themselves still run on
//! this crate's own per-worker scheduler (see `scheduler.rs`), since a
//! `oneshot::Receiver` can be polled from any executor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::runtime::Runtime;

use crate::error::Error;

#[derive(Clone)]
struct Entry {
    expires_at: Instant,
    endpoints: Vec<SocketAddr>,
}

/// TTL-bounded DNS cache used by outbound HTTP clients invoked from handlers.
pub struct ResolverCache {
    ttl: Duration,
    cache: Mutex<HashMap<String, Entry>>,
    dns_runtime: Runtime,
    resolver: TokioAsyncResolver,
}

impl ResolverCache {
    /// Builds a cache with the given TTL (`--server.dns-cache-ttl`, default 5
    /// minutes).
    pub fn new(ttl: Duration) -> std::io::Result<Self> {
        let dns_runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("fiberweb-dns")
            .enable_all()
            .build()?;

        let resolver = dns_runtime.block_on(async {
            TokioAsyncResolver::tokio_from_system_conf()
                .unwrap_or_else(|_| {
                    TokioAsyncResolver::tokio(
                        hickory_resolver::config::ResolverConfig::default(),
                        hickory_resolver::config::ResolverOpts::default(),
                    )
                })
        });

        Ok(ResolverCache {
            ttl,
            cache: Mutex::new(HashMap::new()),
            dns_runtime,
            resolver,
        })
    }

    /// Resolves `host:service`, consulting the cache first. Suspends the
    /// calling task until either the cache hit path (no suspension needed)
    /// or the underlying DNS lookup completes. Fails with
    /// [`Error::Resolve`] if the lookup errors or returns no endpoints.
    pub async fn resolve(&self, host: &str, service: &str) -> Result<Vec<SocketAddr>, Error> {
        let key = format!("{host}:{service}");
        let now = Instant::now();

        {
            let mut cache = self.cache.lock();
            match cache.get(&key) {
                Some(entry) if entry.expires_at > now => return Ok(entry.endpoints.clone()),
                Some(_) => {
                    cache.remove(&key);
                }
                None => {}
            }
        }

        tracing::debug!(%host, %service, "dns cache miss");
        let port: u16 = service.parse().unwrap_or(0);
        let endpoints = self.lookup(host, port).await?;

        if endpoints.is_empty() {
            return Err(Error::Resolve {
                host: host.to_string(),
                service: service.to_string(),
                reason: "no endpoints returned".to_string(),
            });
        }

        let mut cache = self.cache.lock();
        cache.insert(
            key,
            Entry {
                expires_at: now + self.ttl,
                endpoints: endpoints.clone(),
            },
        );

        Ok(endpoints)
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let resolver = self.resolver.clone();
        let host = host.to_string();
        self.dns_runtime.spawn(async move {
            let result = resolver
                .lookup_ip(host.as_str())
                .await
                .map(|lookup| lookup.iter().map(|ip| SocketAddr::new(ip, port)).collect::<Vec<_>>())
                .map_err(|e| e.to_string());
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| Error::Resolve {
                host: host.clone(),
                service: port.to_string(),
                reason: "resolver task dropped".to_string(),
            })?
            .map_err(|reason| Error::Resolve {
                host,
                service: port.to_string(),
                reason,
            })
    }
}

/// Shared handle usable from any worker thread.
pub type SharedResolverCache = Arc<ResolverCache>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_expiry_evicts_entries() {
        let now = Instant::now();
        let entry = Entry {
            expires_at: now - Duration::from_secs(1),
            endpoints: vec!["127.0.0.1:80".parse().unwrap()],
        };
        assert!(entry.expires_at <= now);
    }
}
