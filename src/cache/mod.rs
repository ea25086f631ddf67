//! Two-level caching for compiled artifacts and live strategy instances.
//!
//! The artifact cache is content-addressed and evicts by access count; the
//! instance cache is TTL-based with an optional remote tier. Remote-tier
//! failures degrade to recomputation, never to a caller-visible error.

mod artifact;
mod instance;

pub use artifact::ArtifactCache;
pub use instance::{InstanceCache, InstanceKey, RemoteTier};

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("remote tier unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Point-in-time counters for one cache.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`; zero when nothing was looked up yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "size={} hits={} misses={} evictions={} hit_rate={:.1}%",
            self.size,
            self.hits,
            self.misses,
            self.evictions,
            self.hit_rate() * 100.0
        )
    }
}
