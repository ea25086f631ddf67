//! # Strategy Loader
//!
//! Policy-governed loading of trading strategies for research backtests.
//! User-submitted strategy code is treated as hostile: it is statically
//! validated against a configurable security policy, compiled to a
//! sandboxed WASM module, and executed under hard CPU, memory, and
//! wall-clock ceilings. Platform-authored builtins bypass the sandbox
//! through a trusted registry. Every load attempt leaves an audit trail.
//!
//! ## Architecture
//!
//! - `policy`: security policy model, presets, and the hot-swap handle
//! - `validate` / `scan`: static analysis of untrusted source
//! - `sandbox`: compilation, instantiation, and guest execution
//! - `cache`: compiled-artifact and live-instance caches
//! - `audit`: bounded in-memory audit log with optional JSONL sink
//! - `router`: the front door that ties the pieces together

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod integrity;
pub mod policy;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod scan;
pub mod strategies;
pub mod traits;
pub mod types;
pub mod validate;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSeverity};
pub use cache::{CacheStats, InstanceKey, RemoteTier};
pub use config::LoaderConfig;
pub use error::{LoaderError, LoaderResult, ResourceKind};
pub use integrity::{ContentHash, IntegrityVerifier};
pub use policy::{PolicyFlags, PolicyHandle, ResourceCeilings, SecurityPolicy};
pub use registry::StrategyRegistry;
pub use router::{BatchItem, BatchOutcome, CacheScope, LoaderRouter, RouterStats};
pub use sandbox::{LoadPhase, LoaderStats, SandboxedLoader};
pub use scan::{AccessCategory, PermissionReport, PermissionScanner};
pub use strategies::MomentumStrategy;
pub use traits::{share, MarketData, SharedStrategy, Strategy, StrategyError};
pub use types::{
    EntityId, SignalSide, SourceKind, StrategyConfig, StrategyDescriptor, TradeSignal,
};
pub use validate::{
    Finding, FindingCode, ModuleExport, ModuleImport, RiskLevel, StaticValidator, ValidationReport,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
