//! Error taxonomy for the loading pipeline.
//!
//! Every failure a caller can observe maps onto one of the variants here.
//! Rejection-class errors carry the offending construct and a short detail
//! string rather than raw engine output, so reports stay actionable without
//! leaking sandbox internals.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;

/// Which resource ceiling was breached inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Wall,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Wall => "wall",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for load, validation, and execution setup paths.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Static analysis or the permission scan found a forbidden construct.
    #[error("policy violation ({construct}): {detail}")]
    PolicyViolation { construct: String, detail: String },

    /// Source text does not hash to the pinned content hash.
    #[error("integrity mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch { expected: String, computed: String },

    /// The module failed to compile to a runnable artifact.
    #[error("compilation failed: {detail}")]
    CompileFailure { detail: String },

    /// The module does not expose the required strategy surface.
    #[error("contract violation ({construct}): {detail}")]
    ContractViolation { construct: String, detail: String },

    /// Instantiation or the guest constructor failed.
    #[error("instantiation failed: {detail}")]
    Instantiate { detail: String },

    /// A configured resource ceiling was exceeded.
    #[error("{resource} ceiling exceeded: {detail}")]
    ResourceExceeded { resource: ResourceKind, detail: String },

    /// The wall-clock deadline elapsed before the phase completed.
    #[error("timed out while {phase}")]
    Timeout { phase: String },

    /// Infrastructure the loader depends on was unavailable.
    #[error("infrastructure unavailable: {detail}")]
    TransientInfra { detail: String },
}

impl LoaderError {
    /// Retrying makes sense only for infrastructure failures; everything
    /// else is deterministic for the same input.
    pub fn is_retriable(&self) -> bool {
        matches!(self, LoaderError::TransientInfra { .. })
    }

    /// Terminal outcome tag recorded in audit payloads.
    pub fn outcome(&self) -> &'static str {
        match self {
            LoaderError::PolicyViolation { .. } | LoaderError::IntegrityMismatch { .. } => {
                "rejected"
            }
            LoaderError::CompileFailure { .. } => "compile_failed",
            LoaderError::ContractViolation { .. } | LoaderError::Instantiate { .. } => {
                "instantiate_failed"
            }
            LoaderError::ResourceExceeded { .. } => "resource_exceeded",
            LoaderError::Timeout { .. } => "timed_out",
            LoaderError::TransientInfra { .. } => "infra_unavailable",
        }
    }
}

impl From<CacheError> for LoaderError {
    fn from(err: CacheError) -> Self {
        LoaderError::TransientInfra {
            detail: err.to_string(),
        }
    }
}

pub type LoaderResult<T> = Result<T, LoaderError>;
