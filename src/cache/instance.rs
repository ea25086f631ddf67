//! TTL-based cache for live strategy instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheStats};
use crate::types::SourceKind;

/// Cache key: source kind plus external strategy identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub kind: SourceKind,
    pub id: String,
}

impl InstanceKey {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Optional second cache tier behind the in-process map.
///
/// Implementations hand out shared handles rather than serialized state;
/// a live sandboxed instance is not a value that can cross a wire.
#[async_trait]
pub trait RemoteTier<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, key: &InstanceKey) -> Result<Option<V>, CacheError>;

    async fn store(&self, key: &InstanceKey, value: V, ttl: Duration) -> Result<(), CacheError>;
}

struct InstanceEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> InstanceEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Bounded TTL cache keyed by [`InstanceKey`].
///
/// An expired entry behaves exactly like a miss: the read removes it and
/// reports a miss, so a stale instance is never handed out. Reads, writes,
/// and sweeps may run concurrently from any number of tasks.
pub struct InstanceCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    entries: DashMap<InstanceKey, InstanceEntry<V>>,
    capacity: usize,
    default_ttl: Duration,
    remote: Option<Arc<dyn RemoteTier<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> InstanceCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            default_ttl,
            remote: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteTier<V>>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Local-tier lookup only.
    pub fn get_local(&self, key: &InstanceKey) -> Option<V> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("strategy_loader_instance_cache_hits", 1);
                return Some(entry.value.clone());
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("strategy_loader_instance_cache_misses", 1);
                return None;
            }
        };
        if expired {
            self.entries.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("strategy_loader_instance_cache_misses", 1);
            debug!(%key, "instance entry expired on read");
        }
        None
    }

    /// Lookup through both tiers. A remote hit is backfilled locally; a
    /// remote failure is logged and treated as a miss.
    pub async fn get(&self, key: &InstanceKey) -> Option<V> {
        if let Some(value) = self.get_local(key) {
            return Some(value);
        }
        let remote = self.remote.as_ref()?;
        match remote.fetch(key).await {
            Ok(Some(value)) => {
                self.insert_local_with_ttl(key.clone(), value.clone(), self.default_ttl);
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(%key, error = %e, "remote tier fetch failed; treating as miss");
                None
            }
        }
    }

    pub fn insert_local(&self, key: InstanceKey, value: V) {
        self.insert_local_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_local_with_ttl(&self, key: InstanceKey, value: V, ttl: Duration) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.make_room();
        }
        self.entries.insert(
            key,
            InstanceEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Insert into both tiers. Remote failures degrade to local-only.
    pub async fn insert(&self, key: InstanceKey, value: V) {
        self.insert_local_with_ttl(key.clone(), value.clone(), self.default_ttl);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.store(&key, value, self.default_ttl).await {
                warn!(%key, error = %e, "remote tier store failed; entry is local only");
            }
        }
    }

    /// Expired entries go first; if the cache is still full, the oldest
    /// live entry is evicted.
    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.capacity {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().inserted_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "evicted oldest instance to make room");
        }
    }

    pub fn remove(&self, key: &InstanceKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Sweep all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    /// Remove entries by scope: all of them, or only one source kind.
    pub fn clear_scope(&self, kind: Option<SourceKind>) -> usize {
        let before = self.entries.len();
        match kind {
            None => self.entries.clear(),
            Some(kind) => self.entries.retain(|key, _| key.kind != kind),
        }
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
