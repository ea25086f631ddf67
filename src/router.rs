//! Front door for strategy loading.
//!
//! The router owns the shared infrastructure: the policy handle, the
//! sandboxed loader, the trusted registry, the instance cache, and the
//! audit log. Callers hand it descriptors; it dispatches on source kind
//! and hands back shared strategy handles.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::audit::{AuditEventType, AuditLog, AuditSeverity, JsonlSink};
use crate::cache::{CacheStats, InstanceCache, InstanceKey, RemoteTier};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::policy::{PolicyError, PolicyHandle, SecurityPolicy};
use crate::registry::StrategyRegistry;
use crate::sandbox::{LoaderStats, SandboxedLoader};
use crate::traits::{share, MarketData, SharedStrategy};
use crate::types::{SourceKind, StrategyConfig, StrategyDescriptor};

/// Which cached instances a clear operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Kind(SourceKind),
}

/// Combined introspection over every cache the router owns.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RouterStats {
    pub instances: CacheStats,
    pub artifacts: CacheStats,
    pub loader: LoaderStats,
}

/// One batch request: a descriptor and its instantiation config.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub descriptor: StrategyDescriptor,
    pub config: StrategyConfig,
}

impl BatchItem {
    pub fn new(descriptor: StrategyDescriptor, config: StrategyConfig) -> Self {
        Self { descriptor, config }
    }
}

/// Result of a batch load. Failed items are skipped, not fatal.
#[derive(Default)]
pub struct BatchOutcome {
    pub sandboxed: Vec<(String, SharedStrategy)>,
    pub trusted: Vec<(String, SharedStrategy)>,
    pub failed: Vec<(String, LoaderError)>,
}

impl BatchOutcome {
    pub fn loaded(&self) -> usize {
        self.sandboxed.len() + self.trusted.len()
    }
}

pub struct LoaderRouter {
    policy: Arc<PolicyHandle>,
    sandbox: SandboxedLoader,
    registry: StrategyRegistry,
    instances: InstanceCache<SharedStrategy>,
    audit: Arc<AuditLog>,
    market: Arc<dyn MarketData>,
}

impl LoaderRouter {
    /// Build a router with the default builtin registry.
    pub fn new(
        policy: SecurityPolicy,
        market: Arc<dyn MarketData>,
        config: LoaderConfig,
    ) -> LoaderResult<Self> {
        Self::with_registry(policy, market, config, StrategyRegistry::with_builtins())
    }

    pub fn with_registry(
        policy: SecurityPolicy,
        market: Arc<dyn MarketData>,
        config: LoaderConfig,
        registry: StrategyRegistry,
    ) -> LoaderResult<Self> {
        let policy = Arc::new(PolicyHandle::new(policy).map_err(|e| {
            LoaderError::PolicyViolation {
                construct: "policy".into(),
                detail: e.to_string(),
            }
        })?);

        let mut audit = AuditLog::new(config.audit_capacity);
        if let Some(path) = &config.audit_sink_path {
            let sink = JsonlSink::create(path).map_err(|e| LoaderError::TransientInfra {
                detail: format!("audit sink setup failed: {e}"),
            })?;
            audit = audit.with_sink(Box::new(sink));
        }
        let audit = Arc::new(audit);

        let sandbox = SandboxedLoader::new(
            Arc::clone(&policy),
            Arc::clone(&market),
            Arc::clone(&audit),
            &config,
        )?;

        Ok(Self {
            policy,
            sandbox,
            registry,
            instances: InstanceCache::new(config.instance_capacity, config.instance_ttl),
            audit,
            market,
        })
    }

    /// Attach a remote cache tier behind the in-process instance cache.
    pub fn with_remote_tier(mut self, remote: Arc<dyn RemoteTier<SharedStrategy>>) -> Self {
        self.instances = self.instances.with_remote(remote);
        self
    }

    /// Load one strategy, consulting the instance cache first.
    #[instrument(skip(self, config), fields(strategy = %descriptor.id, kind = %descriptor.kind))]
    pub async fn load(
        &self,
        descriptor: &StrategyDescriptor,
        config: &StrategyConfig,
    ) -> LoaderResult<SharedStrategy> {
        let policy = self.policy.current();
        let caching = policy.flags.caching;
        let auditing = policy.flags.auditing;
        let key = InstanceKey::new(descriptor.kind, descriptor.id.clone());

        if caching {
            if let Some(shared) = self.instances.get(&key).await {
                if auditing {
                    self.audit.record(
                        AuditEventType::CacheHit,
                        descriptor.id.as_str(),
                        AuditSeverity::Info,
                        json!({"tier": "instance"}),
                    );
                }
                return Ok(shared);
            }
            if auditing {
                self.audit.record(
                    AuditEventType::CacheMiss,
                    descriptor.id.as_str(),
                    AuditSeverity::Info,
                    json!({"tier": "instance"}),
                );
            }
        }

        let strategy = match descriptor.kind {
            SourceKind::SandboxedWasm => self.sandbox.load(descriptor, config).await?,
            SourceKind::TrustedBuiltin => self.load_trusted(descriptor, config, auditing)?,
        };

        let shared = share(strategy);
        if caching {
            self.instances.insert(key, shared.clone()).await;
        }
        Ok(shared)
    }

    fn load_trusted(
        &self,
        descriptor: &StrategyDescriptor,
        config: &StrategyConfig,
        auditing: bool,
    ) -> LoaderResult<Box<dyn crate::traits::Strategy>> {
        let result =
            self.registry
                .instantiate(&descriptor.entry_point, config, Arc::clone(&self.market));
        if auditing {
            match &result {
                Ok(_) => self.audit.record(
                    AuditEventType::Load,
                    descriptor.id.as_str(),
                    AuditSeverity::Info,
                    json!({"outcome": "ready", "backend": "trusted", "entry_point": descriptor.entry_point}),
                ),
                Err(err) => self.audit.record(
                    AuditEventType::Load,
                    descriptor.id.as_str(),
                    AuditSeverity::Warning,
                    json!({"outcome": err.outcome(), "backend": "trusted", "error": err.to_string()}),
                ),
            }
        }
        result
    }

    /// Load a heterogeneous batch. Items fail independently; one bad
    /// strategy never blocks its neighbors.
    pub async fn load_batch(&self, items: Vec<BatchItem>) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for item in items {
            let id = item.descriptor.id.clone();
            match self.load(&item.descriptor, &item.config).await {
                Ok(shared) => match item.descriptor.kind {
                    SourceKind::SandboxedWasm => outcome.sandboxed.push((id, shared)),
                    SourceKind::TrustedBuiltin => outcome.trusted.push((id, shared)),
                },
                Err(err) => {
                    warn!(strategy = %id, error = %err, "batch item failed");
                    outcome.failed.push((id, err));
                }
            }
        }
        info!(
            loaded = outcome.loaded(),
            failed = outcome.failed.len(),
            "batch load finished"
        );
        outcome
    }

    /// Swap the active security policy. In-flight loads finish under the
    /// snapshot they started with.
    pub fn swap_policy(&self, policy: SecurityPolicy) -> Result<(), PolicyError> {
        self.policy.swap(policy)
    }

    pub fn current_policy(&self) -> Arc<SecurityPolicy> {
        self.policy.current()
    }

    /// Drop cached instances in scope; returns how many were removed.
    /// Clearing everything also drops compiled artifacts.
    pub fn clear_cache(&self, scope: CacheScope) -> usize {
        match scope {
            CacheScope::All => {
                let removed = self.instances.clear_scope(None);
                removed + self.sandbox.clear_artifacts()
            }
            CacheScope::Kind(kind) => self.instances.clear_scope(Some(kind)),
        }
    }

    /// Drop expired instances eagerly instead of waiting for reads.
    pub fn purge_expired(&self) -> usize {
        self.instances.purge_expired()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            instances: self.instances.stats(),
            artifacts: self.sandbox.artifact_stats(),
            loader: self.sandbox.stats(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}
