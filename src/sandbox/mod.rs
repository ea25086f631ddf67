//! Sandboxed load pipeline for untrusted strategy source.
//!
//! A load moves through a fixed set of phases: received source is
//! validated against the active policy, compiled to a cached artifact,
//! then instantiated under resource ceilings. Each phase either advances
//! or stops at a terminal outcome, and every terminal outcome produces
//! exactly one audit record for the strategy.

pub(crate) mod host;
mod strategy;

pub use strategy::WasmStrategy;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task;
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use wasmtime::{Engine, Module, Store, StoreLimitsBuilder, Trap};

use crate::audit::{AuditEventType, AuditLog, AuditSeverity};
use crate::cache::{ArtifactCache, CacheStats};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult, ResourceKind};
use crate::integrity::ContentHash;
use crate::policy::{PolicyHandle, ResourceCeilings, SecurityPolicy};
use crate::sandbox::host::GuestState;
use crate::scan::{PermissionReport, PermissionScanner};
use crate::traits::{MarketData, Strategy};
use crate::types::{StrategyConfig, StrategyDescriptor};
use crate::validate::{walker, FindingCode, StaticValidator, ValidationReport};

/// Metered instructions treated as one millisecond of cpu budget.
pub(crate) const FUEL_PER_MILLI: u64 = 100_000;

/// How often the engine epoch advances; wall ceilings are rounded up to
/// this granularity.
pub(crate) const EPOCH_PERIOD: Duration = Duration::from_millis(10);

/// Slack added to the host-side timeout backstop so the in-sandbox epoch
/// deadline fires first under normal conditions.
const WALL_GRACE: Duration = Duration::from_millis(500);

/// Pipeline position of a load, recorded in logs and audit payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    Received,
    Validating,
    Rejected,
    Validated,
    Compiling,
    CompileFailed,
    Compiled,
    Instantiating,
    InstantiateFailed,
    Ready,
}

impl LoadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadPhase::Received => "received",
            LoadPhase::Validating => "validating",
            LoadPhase::Rejected => "rejected",
            LoadPhase::Validated => "validated",
            LoadPhase::Compiling => "compiling",
            LoadPhase::CompileFailed => "compile_failed",
            LoadPhase::Compiled => "compiled",
            LoadPhase::Instantiating => "instantiating",
            LoadPhase::InstantiateFailed => "instantiate_failed",
            LoadPhase::Ready => "ready",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoadPhase::Rejected
                | LoadPhase::CompileFailed
                | LoadPhase::InstantiateFailed
                | LoadPhase::Ready
        )
    }
}

impl std::fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Counters {
    validated: AtomicU64,
    rejected: AtomicU64,
    compiled: AtomicU64,
    compile_failed: AtomicU64,
    ready: AtomicU64,
    instantiate_failed: AtomicU64,
}

/// Snapshot of the loader's terminal-outcome counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LoaderStats {
    pub validated: u64,
    pub rejected: u64,
    pub compiled: u64,
    pub compile_failed: u64,
    pub ready: u64,
    pub instantiate_failed: u64,
}

/// Compiled module plus the facts needed to admit it under a policy that
/// may have changed since compilation.
#[derive(Clone)]
struct CompiledArtifact {
    module: Module,
    declared_memory_bytes: u64,
}

/// Advances the shared engine epoch on a fixed period. The thread is
/// detached; dropping the ticker flags it to exit on its next tick.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        thread::Builder::new()
            .name("strategy-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(EPOCH_PERIOD);
                    engine.increment_epoch();
                }
            })?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Loads untrusted strategy source into ready [`Strategy`] instances.
pub struct SandboxedLoader {
    engine: Engine,
    policy: Arc<PolicyHandle>,
    market: Arc<dyn MarketData>,
    audit: Arc<AuditLog>,
    artifacts: ArtifactCache<CompiledArtifact>,
    compile_locks: DashMap<ContentHash, Arc<tokio::sync::Mutex<()>>>,
    counters: Counters,
    _ticker: EpochTicker,
}

impl SandboxedLoader {
    pub fn new(
        policy: Arc<PolicyHandle>,
        market: Arc<dyn MarketData>,
        audit: Arc<AuditLog>,
        config: &LoaderConfig,
    ) -> LoaderResult<Self> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.consume_fuel(true);
        engine_config.epoch_interruption(true);
        let engine = Engine::new(&engine_config).map_err(|e| LoaderError::TransientInfra {
            detail: format!("engine setup failed: {e}"),
        })?;
        let ticker =
            EpochTicker::start(engine.clone()).map_err(|e| LoaderError::TransientInfra {
                detail: format!("epoch ticker failed to start: {e}"),
            })?;
        Ok(Self {
            engine,
            policy,
            market,
            audit,
            artifacts: ArtifactCache::new(config.artifact_capacity),
            compile_locks: DashMap::new(),
            counters: Counters::default(),
            _ticker: ticker,
        })
    }

    /// Run the full pipeline for one sandboxed descriptor.
    #[instrument(skip(self, config), fields(strategy = %descriptor.id))]
    pub async fn load(
        &self,
        descriptor: &StrategyDescriptor,
        config: &StrategyConfig,
    ) -> LoaderResult<Box<dyn Strategy>> {
        let policy = self.policy.current();
        debug!(phase = %LoadPhase::Received, policy_version = policy.version, "load started");
        let source = descriptor
            .source
            .as_deref()
            .ok_or_else(|| LoaderError::ContractViolation {
                construct: "source".into(),
                detail: "sandboxed descriptor carries no source text".into(),
            })?;
        debug!(phase = %LoadPhase::Validating, "static checks running");

        let expected = policy
            .flags
            .verify_hashes
            .then(|| descriptor.content_hash.clone());
        let report = StaticValidator::new(&policy).validate(source, expected.as_ref());
        let scan = policy
            .flags
            .permission_checks
            .then(|| PermissionScanner::new(policy.flags.strict_mode).scan(source));
        let scan_blocked = scan.as_ref().is_some_and(|r| !r.allowed);

        if !report.safe || scan_blocked {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            let err = rejection_error(descriptor, source, &report, scan.as_ref());
            self.audit_terminal(
                descriptor,
                &policy,
                LoadPhase::Rejected,
                AuditEventType::SecurityViolation,
                AuditSeverity::High,
                json!({
                    "outcome": err.outcome(),
                    "risk": report.risk,
                    "errors": report.errors,
                    "warnings": report.warnings,
                    "scan_violations": scan.as_ref().map(|r| &r.violations),
                }),
            );
            return Err(err);
        }
        self.counters.validated.fetch_add(1, Ordering::Relaxed);
        debug!(phase = %LoadPhase::Validated, risk = %report.risk, "validation passed");

        let hash = ContentHash::of(source);
        let artifact = self.obtain_artifact(descriptor, &policy, &hash, source).await?;
        debug!(phase = %LoadPhase::Compiled, hash = %hash.short(), "artifact ready");

        let wall = Duration::from_millis(policy.ceilings.max_wall_millis);
        debug!(
            phase = %LoadPhase::Instantiating,
            wall_ms = policy.ceilings.max_wall_millis,
            "instantiating under ceilings"
        );
        let outcome = match timeout(
            wall + WALL_GRACE,
            self.instantiate(descriptor, &policy, artifact, config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LoaderError::Timeout {
                phase: "instantiating".into(),
            }),
        };

        match outcome {
            Ok(strategy) => {
                self.counters.ready.fetch_add(1, Ordering::Relaxed);
                self.audit_terminal(
                    descriptor,
                    &policy,
                    LoadPhase::Ready,
                    AuditEventType::Load,
                    AuditSeverity::Info,
                    json!({
                        "outcome": "ready",
                        "entry_point": descriptor.entry_point,
                        "content_hash": hash.as_str(),
                    }),
                );
                info!(phase = %LoadPhase::Ready, "strategy ready");
                Ok(strategy)
            }
            Err(err) => {
                self.counters
                    .instantiate_failed
                    .fetch_add(1, Ordering::Relaxed);
                self.audit_terminal(
                    descriptor,
                    &policy,
                    LoadPhase::InstantiateFailed,
                    AuditEventType::Load,
                    AuditSeverity::Warning,
                    json!({"outcome": err.outcome(), "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    /// Fetch from the artifact cache or compile exactly once per hash.
    async fn obtain_artifact(
        &self,
        descriptor: &StrategyDescriptor,
        policy: &SecurityPolicy,
        hash: &ContentHash,
        source: &str,
    ) -> LoaderResult<CompiledArtifact> {
        let caching = policy.flags.caching;
        if caching {
            if let Some(artifact) = self.artifacts.get(hash) {
                return Ok(artifact);
            }
        }

        let lock = self
            .compile_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // Another task may have finished while we waited for the lock.
        if caching {
            if let Some(artifact) = self.artifacts.get(hash) {
                drop(guard);
                self.compile_locks
                    .remove_if(hash, |_, lock| Arc::strong_count(lock) == 1);
                return Ok(artifact);
            }
        }

        debug!(phase = %LoadPhase::Compiling, hash = %hash.short(), "compiling module");
        let compiled = self.compile(source).await;
        // Publish before the guard drops; waiters re-check the cache only
        // after acquiring it.
        if let Ok(artifact) = &compiled {
            self.counters.compiled.fetch_add(1, Ordering::Relaxed);
            if caching {
                self.artifacts.insert(hash.clone(), artifact.clone());
            }
        }
        drop(guard);
        self.compile_locks
            .remove_if(hash, |_, lock| Arc::strong_count(lock) == 1);

        match compiled {
            Ok(artifact) => Ok(artifact),
            Err(err) => {
                self.counters.compile_failed.fetch_add(1, Ordering::Relaxed);
                self.audit_terminal(
                    descriptor,
                    policy,
                    LoadPhase::CompileFailed,
                    AuditEventType::Load,
                    AuditSeverity::Warning,
                    json!({"outcome": err.outcome(), "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    async fn compile(&self, source: &str) -> LoaderResult<CompiledArtifact> {
        let binary = wat::parse_str(source).map_err(|e| LoaderError::CompileFailure {
            detail: first_line(&e.to_string()),
        })?;
        let declared_memory_bytes = walker::declared_memory_bytes(&binary);
        let engine = self.engine.clone();
        let module = task::spawn_blocking(move || Module::new(&engine, &binary))
            .await
            .map_err(|e| LoaderError::TransientInfra {
                detail: format!("compile task failed: {e}"),
            })?
            .map_err(|e| LoaderError::CompileFailure {
                detail: first_line(&e.to_string()),
            })?;
        Ok(CompiledArtifact {
            module,
            declared_memory_bytes,
        })
    }

    async fn instantiate(
        &self,
        descriptor: &StrategyDescriptor,
        policy: &SecurityPolicy,
        artifact: CompiledArtifact,
        config: &StrategyConfig,
    ) -> LoaderResult<Box<dyn Strategy>> {
        let ceilings = policy.ceilings;
        // Declared memory demand is known before anything runs; refusing
        // here keeps the failure deterministic instead of depending on
        // allocator behavior mid-instantiation.
        if artifact.declared_memory_bytes > ceilings.max_memory_bytes {
            return Err(LoaderError::ResourceExceeded {
                resource: ResourceKind::Memory,
                detail: format!(
                    "module declares {} bytes of linear memory, ceiling is {}",
                    artifact.declared_memory_bytes, ceilings.max_memory_bytes
                ),
            });
        }

        let engine = self.engine.clone();
        let market = Arc::clone(&self.market);
        let audit = policy.flags.auditing.then(|| Arc::clone(&self.audit));
        let descriptor = descriptor.clone();
        let config = config.clone();
        task::spawn_blocking(move || {
            instantiate_blocking(
                engine,
                artifact.module,
                ceilings,
                descriptor,
                config,
                market,
                audit,
            )
        })
        .await
        .map_err(|e| LoaderError::TransientInfra {
            detail: format!("instantiate task failed: {e}"),
        })?
    }

    fn audit_terminal(
        &self,
        descriptor: &StrategyDescriptor,
        policy: &SecurityPolicy,
        phase: LoadPhase,
        event_type: AuditEventType,
        severity: AuditSeverity,
        mut payload: Value,
    ) {
        counter!("strategy_loader_loads", 1, "phase" => phase.as_str());
        if !policy.flags.auditing {
            return;
        }
        if let Value::Object(map) = &mut payload {
            map.insert("phase".into(), json!(phase));
            if let Some(actor) = &descriptor.submitted_by {
                map.insert("actor".into(), json!(actor));
            }
        }
        self.audit
            .record(event_type, descriptor.id.as_str(), severity, payload);
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            validated: self.counters.validated.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            compiled: self.counters.compiled.load(Ordering::Relaxed),
            compile_failed: self.counters.compile_failed.load(Ordering::Relaxed),
            ready: self.counters.ready.load(Ordering::Relaxed),
            instantiate_failed: self.counters.instantiate_failed.load(Ordering::Relaxed),
        }
    }

    pub fn artifact_stats(&self) -> CacheStats {
        self.artifacts.stats()
    }

    pub fn clear_artifacts(&self) -> usize {
        self.artifacts.clear()
    }
}

/// Map a rejection report onto the most specific caller-facing error.
fn rejection_error(
    descriptor: &StrategyDescriptor,
    source: &str,
    report: &ValidationReport,
    scan: Option<&PermissionReport>,
) -> LoaderError {
    if report.error(FindingCode::IntegrityMismatch).is_some() {
        return LoaderError::IntegrityMismatch {
            expected: descriptor.content_hash.to_string(),
            computed: ContentHash::of(source).to_string(),
        };
    }
    if let Some(finding) = report.first_error() {
        return LoaderError::PolicyViolation {
            construct: finding.construct.clone(),
            detail: finding.detail.clone(),
        };
    }
    if let Some(violation) = scan.and_then(|r| r.violations.first()) {
        return LoaderError::PolicyViolation {
            construct: violation.category.to_string(),
            detail: violation.detail.clone(),
        };
    }
    if let Some(warning) = report.warnings.first() {
        return LoaderError::PolicyViolation {
            construct: warning.construct.clone(),
            detail: format!("{} (blocking under strict mode)", warning.detail),
        };
    }
    LoaderError::PolicyViolation {
        construct: "module".into(),
        detail: "validation rejected the module".into(),
    }
}

fn instantiate_blocking(
    engine: Engine,
    module: Module,
    ceilings: ResourceCeilings,
    descriptor: StrategyDescriptor,
    config: StrategyConfig,
    market: Arc<dyn MarketData>,
    audit: Option<Arc<AuditLog>>,
) -> LoaderResult<Box<dyn Strategy>> {
    let fuel_budget = ceilings.max_cpu_millis.saturating_mul(FUEL_PER_MILLI).max(1);
    let epoch_ticks = (ceilings.max_wall_millis / EPOCH_PERIOD.as_millis() as u64).max(1);

    let limits = StoreLimitsBuilder::new()
        .memory_size(ceilings.max_memory_bytes as usize)
        .memories(1)
        .tables(4)
        .instances(1)
        .build();
    let state = GuestState {
        limits,
        config,
        market,
        pending_signals: Vec::new(),
        subject: descriptor.id.clone(),
    };
    let mut store = Store::new(&engine, state);
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(fuel_budget)
        .map_err(|e| LoaderError::Instantiate {
            detail: e.to_string(),
        })?;
    store.set_epoch_deadline(epoch_ticks);

    let linker = host::curated_linker(&engine)?;
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(classify_instantiate_error)?;

    if instance.get_memory(&mut store, "memory").is_none() {
        return Err(LoaderError::ContractViolation {
            construct: "memory".into(),
            detail: "module must export its linear memory as \"memory\"".into(),
        });
    }
    let constructor = instance
        .get_func(&mut store, &descriptor.entry_point)
        .ok_or_else(|| LoaderError::ContractViolation {
            construct: descriptor.entry_point.clone(),
            detail: "entry point not found among module exports".into(),
        })?;
    let constructor =
        constructor
            .typed::<(), i32>(&store)
            .map_err(|_| LoaderError::ContractViolation {
                construct: descriptor.entry_point.clone(),
                detail: "entry point must have signature () -> i32".into(),
            })?;
    let score_fn = instance
        .get_typed_func::<(i64, i64), f64>(&mut store, "score")
        .map_err(|_| LoaderError::ContractViolation {
            construct: "score".into(),
            detail: "module must export score(entity: i64, ts: i64) -> f64".into(),
        })?;
    let signals_fn = instance
        .get_typed_func::<i64, ()>(&mut store, "signals")
        .map_err(|_| LoaderError::ContractViolation {
            construct: "signals".into(),
            detail: "module must export signals(ts: i64)".into(),
        })?;

    let status = constructor
        .call(&mut store, ())
        .map_err(|e| classify_guest_error(e, "constructor"))?;
    if status != 0 {
        return Err(LoaderError::Instantiate {
            detail: format!("constructor returned status {status}"),
        });
    }

    Ok(Box::new(WasmStrategy::new(
        descriptor.id,
        store,
        score_fn,
        signals_fn,
        fuel_budget,
        epoch_ticks,
        audit,
    )))
}

fn classify_guest_error(err: wasmtime::Error, phase: &str) -> LoaderError {
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => LoaderError::ResourceExceeded {
            resource: ResourceKind::Cpu,
            detail: format!("fuel exhausted during {phase}"),
        },
        Some(Trap::Interrupt) => LoaderError::Timeout {
            phase: phase.to_string(),
        },
        Some(trap) => LoaderError::Instantiate {
            detail: format!("{phase} trapped: {trap}"),
        },
        None => LoaderError::Instantiate {
            detail: first_line(&err.to_string()),
        },
    }
}

/// Instantiation failures that are not traps are link errors: the module
/// demands imports the curated surface does not define.
fn classify_instantiate_error(err: wasmtime::Error) -> LoaderError {
    if err.downcast_ref::<Trap>().is_some() {
        return classify_guest_error(err, "start function");
    }
    LoaderError::ContractViolation {
        construct: "imports".into(),
        detail: first_line(&err.to_string()),
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::testutil::TableFake;
    use chrono::Utc;

    const GOOD_STRATEGY: &str = r#"(module
        (import "config" "get" (func $cfg (param i32 i32) (result f64)))
        (import "data" "value" (func $value (param i64 i32 i32 i64) (result f64)))
        (import "signal" "emit" (func $emit (param i64 i32 f64)))
        (memory (export "memory") 1)
        (data (i32.const 0) "close")
        (data (i32.const 16) "threshold")
        (func (export "init") (result i32)
            (i32.const 0))
        (func (export "score") (param $entity i64) (param $ts i64) (result f64)
            (call $value (local.get $entity) (i32.const 0) (i32.const 5) (local.get $ts)))
        (func (export "signals") (param $ts i64)
            (if (f64.gt
                    (call $value (i64.const 1) (i32.const 0) (i32.const 5) (local.get $ts))
                    (call $cfg (i32.const 16) (i32.const 9)))
                (then (call $emit (i64.const 1) (i32.const 0) (f64.const 0.9))))))"#;

    fn market() -> Arc<dyn MarketData> {
        Arc::new(TableFake::new().with_row(1, "close", 120.0).with_row(2, "close", 80.0))
    }

    fn loader_with(policy: SecurityPolicy) -> SandboxedLoader {
        let handle = Arc::new(PolicyHandle::new(policy).unwrap());
        let audit = Arc::new(AuditLog::new(256));
        SandboxedLoader::new(handle, market(), audit, &LoaderConfig::minimal()).unwrap()
    }

    fn loader() -> SandboxedLoader {
        loader_with(SecurityPolicy::standard())
    }

    #[tokio::test]
    async fn ready_strategy_scores_and_signals() {
        let loader = loader();
        let descriptor = StrategyDescriptor::sandboxed("mom-1", "init", GOOD_STRATEGY);
        let config = StrategyConfig::new().set("threshold", 100.0);

        let mut strategy = loader.load(&descriptor, &config).await.unwrap();
        let as_of = Utc::now();

        let score = strategy.score(1, as_of).unwrap();
        assert_eq!(score, 120.0);

        let signals = strategy.signals(as_of).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].entity, 1);
        assert_eq!(signals[0].strength, 0.9);
        assert_eq!(signals[0].as_of, as_of);

        let stats = loader.stats();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn forbidden_import_is_rejected_with_audit() {
        let loader = loader();
        let hostile = r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (memory (export "memory") 1)
            (func (export "init") (result i32) (i32.const 0))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0))
            (func (export "signals") (param i64)))"#;
        let descriptor = StrategyDescriptor::sandboxed("bad-1", "init", hostile);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LoaderError::PolicyViolation { .. }));
        assert_eq!(loader.stats().rejected, 1);

        let events = loader.audit.for_subject("bad-1");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SecurityViolation);
        assert_eq!(events[0].payload["phase"], "rejected");
    }

    #[tokio::test]
    async fn tampered_source_is_an_integrity_mismatch() {
        let loader = loader();
        let mut descriptor = StrategyDescriptor::sandboxed("tamper-1", "init", GOOD_STRATEGY);
        descriptor.content_hash = ContentHash::of("the original text");

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LoaderError::IntegrityMismatch { .. }));
    }

    #[tokio::test]
    async fn hash_check_is_skipped_when_disabled() {
        let mut policy = SecurityPolicy::standard();
        policy.flags.verify_hashes = false;
        let loader = loader_with(policy);

        let mut descriptor = StrategyDescriptor::sandboxed("tamper-2", "init", GOOD_STRATEGY);
        descriptor.content_hash = ContentHash::of("the original text");
        assert!(loader.load(&descriptor, &StrategyConfig::new()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_export_is_a_contract_violation() {
        let loader = loader();
        let no_signals = r#"(module
            (memory (export "memory") 1)
            (func (export "init") (result i32) (i32.const 0))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0)))"#;
        let descriptor = StrategyDescriptor::sandboxed("partial-1", "init", no_signals);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        match err {
            LoaderError::ContractViolation { construct, .. } => assert_eq!(construct, "signals"),
            other => panic!("expected contract violation, got {other}"),
        }
        assert_eq!(loader.stats().instantiate_failed, 1);
    }

    #[tokio::test]
    async fn missing_entry_point_names_the_construct() {
        let loader = loader();
        let descriptor = StrategyDescriptor::sandboxed("entry-1", "setup", GOOD_STRATEGY);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        match err {
            LoaderError::ContractViolation { construct, detail } => {
                assert_eq!(construct, "setup");
                assert!(detail.contains("not found"));
            }
            other => panic!("expected contract violation, got {other}"),
        }
    }

    #[tokio::test]
    async fn failing_constructor_is_an_instantiate_error() {
        let loader = loader();
        let failing = r#"(module
            (memory (export "memory") 1)
            (func (export "init") (result i32) (i32.const 7))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0))
            (func (export "signals") (param i64)))"#;
        let descriptor = StrategyDescriptor::sandboxed("ctor-1", "init", failing);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        match err {
            LoaderError::Instantiate { detail } => assert!(detail.contains("status 7")),
            other => panic!("expected instantiate error, got {other}"),
        }
    }

    #[tokio::test]
    async fn runaway_constructor_exhausts_cpu_budget() {
        let mut policy = SecurityPolicy::standard();
        policy.ceilings.max_cpu_millis = 20;
        let loader = loader_with(policy);

        let spinning = r#"(module
            (memory (export "memory") 1)
            (func (export "init") (result i32)
                (loop $spin (br $spin))
                (i32.const 0))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0))
            (func (export "signals") (param i64)))"#;
        let descriptor = StrategyDescriptor::sandboxed("spin-1", "init", spinning);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LoaderError::ResourceExceeded {
                resource: ResourceKind::Cpu,
                ..
            }
        ));
        assert_eq!(loader.stats().instantiate_failed, 1);
    }

    #[tokio::test]
    async fn oversized_memory_is_refused_before_running() {
        let mut policy = SecurityPolicy::standard();
        policy.ceilings.max_memory_bytes = 1024 * 1024;
        let loader = loader_with(policy);

        // 64 pages = 4 MiB declared, over the 1 MiB ceiling.
        let greedy = r#"(module
            (memory (export "memory") 64)
            (func (export "init") (result i32) (i32.const 0))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0))
            (func (export "signals") (param i64)))"#;
        let descriptor = StrategyDescriptor::sandboxed("greedy-1", "init", greedy);

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LoaderError::ResourceExceeded {
                resource: ResourceKind::Memory,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn signal_flood_is_capped_by_the_host_buffer() {
        let flood = r#"(module
            (import "signal" "emit" (func $emit (param i64 i32 f64)))
            (memory (export "memory") 1)
            (func (export "init") (result i32) (i32.const 0))
            (func (export "score") (param i64 i64) (result f64) (f64.const 0))
            (func (export "signals") (param $ts i64)
                (local $n i32)
                (local.set $n (i32.const 20000))
                (loop $again
                    (call $emit (i64.const 1) (i32.const 0) (f64.const 0.5))
                    (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                    (br_if $again (i32.gt_s (local.get $n) (i32.const 0))))))"#;
        let loader = loader();
        let descriptor = StrategyDescriptor::sandboxed("flood-1", "init", flood);

        let mut strategy = loader.load(&descriptor, &StrategyConfig::new()).await.unwrap();
        let signals = strategy.signals(Utc::now()).unwrap();
        assert_eq!(signals.len(), host::MAX_PENDING_SIGNALS);
    }

    #[tokio::test]
    async fn identical_source_compiles_once() {
        let loader = loader();
        let config = StrategyConfig::new();
        for i in 0..3 {
            let descriptor =
                StrategyDescriptor::sandboxed(format!("copy-{i}"), "init", GOOD_STRATEGY);
            loader.load(&descriptor, &config).await.unwrap();
        }
        assert_eq!(loader.stats().compiled, 1);
        assert!(loader.artifact_stats().hits >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_loads_share_one_compile() {
        let loader = Arc::new(loader());
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let loader = Arc::clone(&loader);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                let descriptor =
                    StrategyDescriptor::sandboxed(format!("par-{i}"), "init", GOOD_STRATEGY);
                barrier.wait().await;
                loader.load(&descriptor, &StrategyConfig::new()).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        // Waiters queued on the compile lock must find the artifact already
        // published when they re-check the cache.
        assert_eq!(loader.stats().compiled, 1);
        assert_eq!(loader.stats().ready, 8);
        assert_eq!(loader.artifact_stats().size, 1);
    }

    #[tokio::test]
    async fn caching_flag_disables_artifact_reuse() {
        let mut policy = SecurityPolicy::standard();
        policy.flags.caching = false;
        let loader = loader_with(policy);
        let config = StrategyConfig::new();

        for i in 0..2 {
            let descriptor =
                StrategyDescriptor::sandboxed(format!("nc-{i}"), "init", GOOD_STRATEGY);
            loader.load(&descriptor, &config).await.unwrap();
        }
        assert_eq!(loader.stats().compiled, 2);
        assert_eq!(loader.artifact_stats().size, 0);
    }

    #[tokio::test]
    async fn ready_load_emits_exactly_one_load_event() {
        let loader = loader();
        let descriptor = StrategyDescriptor::sandboxed("audit-1", "init", GOOD_STRATEGY)
            .submitted_by("researcher-7");
        loader.load(&descriptor, &StrategyConfig::new()).await.unwrap();

        let events = loader.audit.for_subject("audit-1");
        let loads: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == AuditEventType::Load)
            .collect();
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].payload["outcome"], "ready");
        assert_eq!(loads[0].payload["actor"], "researcher-7");
    }

    #[tokio::test]
    async fn descriptor_without_source_is_rejected() {
        let loader = loader();
        let mut descriptor = StrategyDescriptor::sandboxed("empty-1", "init", GOOD_STRATEGY);
        descriptor.source = None;

        let err = loader
            .load(&descriptor, &StrategyConfig::new())
            .await
            .err()
            .unwrap();
        match err {
            LoaderError::ContractViolation { construct, .. } => assert_eq!(construct, "source"),
            other => panic!("expected contract violation, got {other}"),
        }
    }
}
