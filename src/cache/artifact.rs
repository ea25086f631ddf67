//! Content-addressed cache for compiled artifacts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use parking_lot::RwLock;
use tracing::debug;

use crate::cache::CacheStats;
use crate::integrity::ContentHash;

struct ArtifactEntry<V> {
    value: V,
    access_count: AtomicU64,
    inserted_seq: u64,
}

/// Bounded map from content hash to compiled artifact.
///
/// Reads bump a per-entry access counter; when the cache is full the entry
/// with the fewest accesses is evicted, insertion order breaking ties in
/// favor of the oldest. Eviction only ever runs while the write lock is
/// held, so the least-accessed choice is exact, not approximate.
pub struct ArtifactCache<V> {
    entries: RwLock<HashMap<ContentHash, ArtifactEntry<V>>>,
    capacity: usize,
    insert_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> ArtifactCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            insert_seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &ContentHash) -> Option<V> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) => {
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("strategy_loader_artifact_cache_hits", 1);
                Some(entry.value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("strategy_loader_artifact_cache_misses", 1);
                None
            }
        }
    }

    /// Insert an artifact. Content-addressed, so inserting under an
    /// existing key is a no-op; the cached value is already the right one.
    pub fn insert(&self, key: ContentHash, value: V) {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return;
        }
        if entries.len() >= self.capacity {
            self.evict_least_accessed(&mut entries);
        }
        let seq = self.insert_seq.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            ArtifactEntry {
                value,
                access_count: AtomicU64::new(0),
                inserted_seq: seq,
            },
        );
        gauge!("strategy_loader_artifact_cache_entries", entries.len() as f64);
    }

    fn evict_least_accessed(&self, entries: &mut HashMap<ContentHash, ArtifactEntry<V>>) {
        let victim = entries
            .iter()
            .min_by_key(|(_, entry)| {
                (
                    entry.access_count.load(Ordering::Relaxed),
                    entry.inserted_seq,
                )
            })
            .map(|(key, entry)| (key.clone(), entry.access_count.load(Ordering::Relaxed)));
        if let Some((key, count)) = victim {
            entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!("strategy_loader_artifact_cache_evictions", 1);
            debug!(key = %key.short(), access_count = count, "evicted least-accessed artifact");
        }
    }

    pub fn contains(&self, key: &ContentHash) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all artifacts, keeping counters intact.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: 0,
        }
    }
}
