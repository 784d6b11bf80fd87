//! Service-record resolution for route targets without an explicit port.
//!
//! Lookups go through a small cache shared by every connection:
//! - entries live for [`DEFAULT_SRV_TTL`] (failed lookups are cached too)
//! - at most [`DEFAULT_SRV_MAX_ENTRIES`] names are kept, oldest evicted first
//! - the check-query-insert-evict sequence runs under a single lock

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::address::Address;

/// How long a resolved (or failed) record is reused.
pub const DEFAULT_SRV_TTL: Duration = Duration::from_secs(10);

/// Maximum number of cached names.
pub const DEFAULT_SRV_MAX_ENTRIES: usize = 100;

/// Service label queried as `_<service>._tcp.<hostname>`.
pub const DEFAULT_SRV_SERVICE: &str = "minecraft";

/// A source of SRV records.
#[async_trait]
pub trait SrvLookup: Send + Sync {
    /// Query the fully-qualified record `name` and return the first
    /// target as `host:port`, or `None` if there is no usable answer.
    async fn lookup(&self, name: &str) -> Option<Address>;
}

/// DNS-backed lookup using the system resolver configuration.
pub struct HickorySrvLookup {
    resolver: TokioAsyncResolver,
}

impl HickorySrvLookup {
    /// Build from `/etc/resolv.conf` (or platform equivalent), falling back
    /// to the library defaults when it cannot be read.
    pub fn new() -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "Failed to read system resolver config, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        // One try per query; a miss falls back to the default port anyway.
        opts.attempts = 1;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

impl Default for HickorySrvLookup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SrvLookup for HickorySrvLookup {
    async fn lookup(&self, name: &str) -> Option<Address> {
        let answer = match self.resolver.srv_lookup(name).await {
            Ok(answer) => answer,
            Err(e) => {
                debug!(name = %name, error = %e, "SRV lookup failed");
                return None;
            }
        };

        let record = answer.iter().next()?;
        let target = record.target().to_utf8();
        let host = target.strip_suffix('.').unwrap_or(&target);

        Address::new(host, Some(record.port())).ok()
    }
}

#[derive(Debug)]
struct CacheEntry {
    address: Option<Address>,
    resolved_at: Instant,
}

/// Insertion-ordered cache contents.
#[derive(Debug, Default)]
struct SrvCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl SrvCache {
    fn insert(&mut self, hostname: &str, entry: CacheEntry, max_entries: usize) {
        if self.entries.insert(hostname.to_string(), entry).is_some() {
            self.order.retain(|h| h != hostname);
        }
        self.order.push_back(hostname.to_string());

        while self.entries.len() > max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Cached SRV resolver shared across connections.
pub struct SrvResolver {
    lookup: Arc<dyn SrvLookup>,
    service: String,
    ttl: Duration,
    max_entries: usize,
    cache: Mutex<SrvCache>,
}

impl SrvResolver {
    /// Create a resolver with the default service label, TTL and size.
    pub fn new(lookup: Arc<dyn SrvLookup>) -> Self {
        Self::with_limits(lookup, DEFAULT_SRV_TTL, DEFAULT_SRV_MAX_ENTRIES)
    }

    /// Create a resolver with a custom TTL and cache size.
    pub fn with_limits(lookup: Arc<dyn SrvLookup>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            lookup,
            service: DEFAULT_SRV_SERVICE.to_string(),
            ttl,
            max_entries,
            cache: Mutex::new(SrvCache::default()),
        }
    }

    /// Resolve `_<service>._tcp.<hostname>`, serving from cache within the TTL.
    pub async fn resolve(&self, hostname: &str) -> Option<Address> {
        let mut cache = self.cache.lock().await;
        let now = Instant::now();

        if let Some(entry) = cache.entries.get(hostname) {
            if now.duration_since(entry.resolved_at) < self.ttl {
                debug!(hostname = %hostname, "SRV cache hit");
                return entry.address.clone();
            }
        }

        let name = format!("_{}._tcp.{}", self.service, hostname);
        let address = self.lookup.lookup(&name).await;
        debug!(
            name = %name,
            result = ?address.as_ref().map(ToString::to_string),
            "SRV resolved"
        );

        cache.insert(
            hostname,
            CacheEntry {
                address: address.clone(),
                resolved_at: now,
            },
            self.max_entries,
        );
        address
    }

    /// Number of names currently cached.
    pub async fn cached_entries(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// In-memory SRV source that counts queries.
    #[derive(Default)]
    pub struct StaticSrvLookup {
        pub records: HashMap<String, Address>,
        pub queries: AtomicUsize,
    }

    impl StaticSrvLookup {
        pub fn with_record(name: &str, target: &str) -> Self {
            let mut records = HashMap::new();
            records.insert(name.to_string(), Address::parse(target).unwrap());
            Self {
                records,
                queries: AtomicUsize::new(0),
            }
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SrvLookup for StaticSrvLookup {
        async fn lookup(&self, name: &str) -> Option<Address> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.records.get(name).cloned()
        }
    }
}
