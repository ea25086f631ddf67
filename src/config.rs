//! Runtime configuration for the loader stack.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capacities and paths for caches and the audit log.
///
/// Everything here is infrastructure sizing; security-relevant knobs live
/// on [`crate::policy::SecurityPolicy`] so they can be hot-swapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Compiled artifacts kept in memory.
    pub artifact_capacity: usize,
    /// Live strategy instances kept in memory.
    pub instance_capacity: usize,
    /// How long a cached instance stays fresh.
    pub instance_ttl: Duration,
    /// Audit events retained in the in-memory ring.
    pub audit_capacity: usize,
    /// When set, every audit event is also appended here as JSON lines.
    pub audit_sink_path: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            artifact_capacity: 64,
            instance_capacity: 256,
            instance_ttl: Duration::from_secs(300),
            audit_capacity: 4_096,
            audit_sink_path: None,
        }
    }
}

impl LoaderConfig {
    /// Small footprint for tests and local runs.
    pub fn minimal() -> Self {
        Self {
            artifact_capacity: 4,
            instance_capacity: 8,
            instance_ttl: Duration::from_secs(30),
            audit_capacity: 256,
            audit_sink_path: None,
        }
    }
}
