//! Security policy governing what strategy code may do.
//!
//! A policy is a plain value: allow/deny sets over the module's capability
//! surface, resource ceilings, and behavior flags. Policies serialize to
//! TOML for operator visibility and load back with validation, so a bad
//! edit can never reach enforcement. [`PolicyHandle`] publishes the active
//! policy atomically; in-flight loads keep the snapshot they started with.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("ceiling {name} must be nonzero")]
    ZeroCeiling { name: &'static str },

    #[error("{name} must not be empty")]
    EmptySet { name: &'static str },

    #[error("invalid policy document: {0}")]
    Document(String),
}

/// Hard resource ceilings applied to every sandboxed strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCeilings {
    /// Upper bound on guest linear memory, in bytes.
    pub max_memory_bytes: u64,
    /// CPU budget per guest call, in milliseconds of metered execution.
    pub max_cpu_millis: u64,
    /// Wall-clock deadline per guest call, in milliseconds.
    pub max_wall_millis: u64,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_cpu_millis: 2_000,
            max_wall_millis: 5_000,
        }
    }
}

/// Feature toggles carried by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFlags {
    /// Treat warnings as blocking and tighten the permission scan.
    pub strict_mode: bool,
    /// Recompute and compare content hashes on every load.
    pub verify_hashes: bool,
    /// Run the textual permission scan in addition to static analysis.
    pub permission_checks: bool,
    /// Record load and execution events to the audit log.
    pub auditing: bool,
    /// Use the artifact and instance caches.
    pub caching: bool,
}

impl Default for PolicyFlags {
    fn default() -> Self {
        Self {
            strict_mode: false,
            verify_hashes: true,
            permission_checks: true,
            auditing: true,
            caching: true,
        }
    }
}

/// Declarative description of what loaded strategies may import and call.
///
/// Sets are ordered so serialized policies diff cleanly between versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Monotonic version, bumped by operators on every published change.
    pub version: u32,
    /// Import namespaces the sandbox provides and permits.
    pub allowed_imports: BTreeSet<String>,
    /// Import namespaces that reject the module outright.
    pub forbidden_imports: BTreeSet<String>,
    /// Call targets (qualified `module.field` or bare field) that reject.
    pub forbidden_calls: BTreeSet<String>,
    /// Imported field names that reject regardless of namespace.
    pub forbidden_attributes: BTreeSet<String>,
    pub ceilings: ResourceCeilings,
    pub flags: PolicyFlags,
}

fn string_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl SecurityPolicy {
    /// Balanced defaults for research workloads.
    pub fn standard() -> Self {
        Self {
            version: 1,
            allowed_imports: string_set(&["env", "math", "data", "config", "signal"]),
            forbidden_imports: string_set(&[
                "wasi_snapshot_preview1",
                "wasi_unstable",
                "wasi",
                "host",
                "spectest",
            ]),
            forbidden_calls: string_set(&[
                "proc_exec",
                "proc_spawn",
                "proc_raise",
                "sock_open",
                "sock_send",
                "sock_recv",
                "path_open",
                "fd_write",
                "fd_read",
                "environ_get",
                "random_get",
            ]),
            forbidden_attributes: string_set(&[
                "exec", "spawn", "system", "eval", "fork", "kill", "unlink", "connect", "bind",
            ]),
            ceilings: ResourceCeilings::default(),
            flags: PolicyFlags::default(),
        }
    }

    /// Loose ceilings and no hash pinning, for local iteration on
    /// strategies that change with every keystroke.
    pub fn permissive_development() -> Self {
        let mut policy = Self::standard();
        policy.ceilings = ResourceCeilings {
            max_memory_bytes: 256 * 1024 * 1024,
            max_cpu_millis: 10_000,
            max_wall_millis: 30_000,
        };
        policy.flags.verify_hashes = false;
        policy
    }

    /// Tight ceilings, strict scanning, and an extended deny surface.
    pub fn hardened_production() -> Self {
        let mut policy = Self::standard();
        policy.ceilings = ResourceCeilings {
            max_memory_bytes: 32 * 1024 * 1024,
            max_cpu_millis: 500,
            max_wall_millis: 2_000,
        };
        policy.flags.strict_mode = true;
        for attr in ["open", "dlopen", "mmap", "ioctl"] {
            policy.forbidden_attributes.insert(attr.to_string());
        }
        for call in ["clock_time_get", "poll_oneoff"] {
            policy.forbidden_calls.insert(call.to_string());
        }
        policy
    }

    /// Structural checks applied before a policy may become active.
    ///
    /// The allow/deny import pair must be populated; call and attribute
    /// deny sets are refinements and may legitimately be empty.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.ceilings.max_memory_bytes == 0 {
            return Err(PolicyError::ZeroCeiling {
                name: "max_memory_bytes",
            });
        }
        if self.ceilings.max_cpu_millis == 0 {
            return Err(PolicyError::ZeroCeiling {
                name: "max_cpu_millis",
            });
        }
        if self.ceilings.max_wall_millis == 0 {
            return Err(PolicyError::ZeroCeiling {
                name: "max_wall_millis",
            });
        }
        if self.allowed_imports.is_empty() {
            return Err(PolicyError::EmptySet {
                name: "allowed_imports",
            });
        }
        if self.forbidden_imports.is_empty() {
            return Err(PolicyError::EmptySet {
                name: "forbidden_imports",
            });
        }
        Ok(())
    }

    /// Add an import namespace to the allow set. No-op when the namespace
    /// is already forbidden; deny always wins.
    pub fn add_allowed_import(&mut self, namespace: impl Into<String>) -> bool {
        let namespace = namespace.into();
        if self.forbidden_imports.contains(&namespace) {
            return false;
        }
        self.allowed_imports.insert(namespace)
    }

    /// Forbid an import namespace, removing it from the allow set if
    /// present.
    pub fn add_forbidden_import(&mut self, namespace: impl Into<String>) -> bool {
        let namespace = namespace.into();
        self.allowed_imports.remove(&namespace);
        self.forbidden_imports.insert(namespace)
    }

    pub fn add_forbidden_call(&mut self, target: impl Into<String>) -> bool {
        self.forbidden_calls.insert(target.into())
    }

    pub fn add_forbidden_attribute(&mut self, attribute: impl Into<String>) -> bool {
        self.forbidden_attributes.insert(attribute.into())
    }

    pub fn is_import_allowed(&self, namespace: &str) -> bool {
        !self.forbidden_imports.contains(namespace) && self.allowed_imports.contains(namespace)
    }

    pub fn is_import_forbidden(&self, namespace: &str) -> bool {
        self.forbidden_imports.contains(namespace)
    }

    /// Serialize for operator review or persistence.
    pub fn to_document(&self) -> Result<String, PolicyError> {
        toml::to_string_pretty(self).map_err(|e| PolicyError::Document(e.to_string()))
    }

    /// Parse and validate a policy document; invalid documents never
    /// produce a usable policy.
    pub fn from_document(document: &str) -> Result<Self, PolicyError> {
        let policy: SecurityPolicy =
            toml::from_str(document).map_err(|e| PolicyError::Document(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }
}

/// Atomically swappable handle to the active policy.
///
/// Readers take a cheap snapshot via [`PolicyHandle::current`]; a swap
/// publishes a fully validated replacement without blocking readers.
pub struct PolicyHandle {
    inner: ArcSwap<SecurityPolicy>,
}

impl PolicyHandle {
    pub fn new(policy: SecurityPolicy) -> Result<Self, PolicyError> {
        policy.validate()?;
        Ok(Self {
            inner: ArcSwap::from_pointee(policy),
        })
    }

    /// Snapshot of the policy active right now. Holders keep this exact
    /// version for their whole operation even if a swap lands meanwhile.
    pub fn current(&self) -> Arc<SecurityPolicy> {
        self.inner.load_full()
    }

    /// Validate and publish a replacement policy.
    pub fn swap(&self, policy: SecurityPolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        let version = policy.version;
        self.inner.store(Arc::new(policy));
        info!(version, "security policy swapped");
        Ok(())
    }
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.inner.load();
        f.debug_struct("PolicyHandle")
            .field("version", &current.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_pass_validation() {
        assert!(SecurityPolicy::standard().validate().is_ok());
        assert!(SecurityPolicy::permissive_development().validate().is_ok());
        assert!(SecurityPolicy::hardened_production().validate().is_ok());
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let mut policy = SecurityPolicy::standard();
        policy.ceilings.max_cpu_millis = 0;
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::ZeroCeiling {
                name: "max_cpu_millis"
            })
        ));
    }

    #[test]
    fn empty_allow_set_is_rejected() {
        let mut policy = SecurityPolicy::standard();
        policy.allowed_imports.clear();
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::EmptySet {
                name: "allowed_imports"
            })
        ));
    }

    #[test]
    fn deny_wins_over_allow() {
        let mut policy = SecurityPolicy::standard();
        assert!(!policy.add_allowed_import("wasi_snapshot_preview1"));
        assert!(!policy.is_import_allowed("wasi_snapshot_preview1"));

        assert!(policy.add_forbidden_import("math"));
        assert!(!policy.is_import_allowed("math"));
        assert!(policy.is_import_forbidden("math"));
    }

    #[test]
    fn document_round_trip_preserves_policy() {
        let policy = SecurityPolicy::hardened_production();
        let document = policy.to_document().unwrap();
        let back = SecurityPolicy::from_document(&document).unwrap();
        assert_eq!(policy, back);
    }

    #[test]
    fn invalid_document_never_loads() {
        let mut policy = SecurityPolicy::standard();
        policy.forbidden_imports.clear();
        let document = policy.to_document().unwrap();
        assert!(SecurityPolicy::from_document(&document).is_err());
    }

    #[test]
    fn handle_swap_is_atomic_for_holders() {
        let handle = PolicyHandle::new(SecurityPolicy::standard()).unwrap();
        let snapshot = handle.current();
        assert_eq!(snapshot.version, 1);

        let mut next = SecurityPolicy::hardened_production();
        next.version = 2;
        handle.swap(next).unwrap();

        // The held snapshot is unchanged; new reads see the replacement.
        assert_eq!(snapshot.version, 1);
        assert_eq!(handle.current().version, 2);
    }

    #[test]
    fn handle_rejects_invalid_swap() {
        let handle = PolicyHandle::new(SecurityPolicy::standard()).unwrap();
        let mut bad = SecurityPolicy::standard();
        bad.ceilings.max_memory_bytes = 0;
        assert!(handle.swap(bad).is_err());
        assert_eq!(handle.current().version, 1);
    }
}
