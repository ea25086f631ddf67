//! Core data types shared across the loading pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::integrity::ContentHash;

/// Stable identifier for a tradable entity in the research tables.
pub type EntityId = i64;

/// Where a strategy's code comes from, which decides the load path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Untrusted user-submitted source, always run inside the sandbox.
    SandboxedWasm,
    /// Platform-authored native strategy resolved through the registry.
    TrustedBuiltin,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SandboxedWasm => "sandboxed_wasm",
            SourceKind::TrustedBuiltin => "trusted_builtin",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the loader needs to know about one strategy submission.
///
/// Descriptors usually come out of the persistence layer with the content
/// hash pinned at submission time; the loader recomputes and compares on
/// every load rather than trusting the stored value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDescriptor {
    /// External identifier, unique per strategy.
    pub id: String,
    pub kind: SourceKind,
    /// Exported constructor name for sandboxed code, registry key for
    /// trusted builtins.
    pub entry_point: String,
    /// Source text for sandboxed strategies. Trusted builtins carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Hash pinned when the strategy was accepted for storage.
    pub content_hash: ContentHash,
    pub created_at: DateTime<Utc>,
    /// Account or service that submitted the strategy, for audit trails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
}

impl StrategyDescriptor {
    /// Descriptor for freshly submitted sandboxed source, hash computed
    /// from the text itself.
    pub fn sandboxed(
        id: impl Into<String>,
        entry_point: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let content_hash = ContentHash::of(&source);
        Self {
            id: id.into(),
            kind: SourceKind::SandboxedWasm,
            entry_point: entry_point.into(),
            source: Some(source),
            content_hash,
            created_at: Utc::now(),
            submitted_by: None,
        }
    }

    /// Descriptor for a platform builtin; the entry point names the
    /// registry key.
    pub fn builtin(id: impl Into<String>, entry_point: impl Into<String>) -> Self {
        let id = id.into();
        let content_hash = ContentHash::of(&id);
        Self {
            id,
            kind: SourceKind::TrustedBuiltin,
            entry_point: entry_point.into(),
            source: None,
            content_hash,
            created_at: Utc::now(),
            submitted_by: None,
        }
    }

    pub fn submitted_by(mut self, actor: impl Into<String>) -> Self {
        self.submitted_by = Some(actor.into());
        self
    }
}

/// Numeric parameters handed to a strategy at instantiation.
///
/// Kept deliberately flat: every tunable is a named float, which is what
/// the guest-side `config.get` capability can answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    values: BTreeMap<String, f64>,
}

impl StrategyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn get_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Trade direction attached to an emitted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSide {
    Buy,
    Sell,
}

impl SignalSide {
    /// Wire encoding used by the guest `signal.emit` capability.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(SignalSide::Buy),
            1 => Some(SignalSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSide::Buy => f.write_str("buy"),
            SignalSide::Sell => f.write_str("sell"),
        }
    }
}

/// Point-in-time trading signal produced by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub entity: EntityId,
    pub side: SignalSide,
    /// Conviction in `[0.0, 1.0]`; values outside are clamped at emit.
    pub strength: f64,
    pub as_of: DateTime<Utc>,
}

impl TradeSignal {
    pub fn new(entity: EntityId, side: SignalSide, strength: f64, as_of: DateTime<Utc>) -> Self {
        Self {
            entity,
            side,
            strength: strength.clamp(0.0, 1.0),
            as_of,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandboxed_descriptor_pins_hash_of_source() {
        let a = StrategyDescriptor::sandboxed("s-1", "init", "(module)");
        let b = StrategyDescriptor::sandboxed("s-2", "init", "(module)");
        assert_eq!(a.content_hash, b.content_hash);

        let c = StrategyDescriptor::sandboxed("s-3", "init", "(module (func))");
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn config_lookup_and_defaults() {
        let config = StrategyConfig::new()
            .set("lookback_days", 20.0)
            .set("entry_threshold", 0.05);
        assert_eq!(config.get("lookback_days"), Some(20.0));
        assert_eq!(config.get_or("missing", 1.5), 1.5);
        assert!(config.contains("entry_threshold"));
        assert_eq!(config.len(), 2);
    }

    #[test]
    fn signal_strength_is_clamped() {
        let now = Utc::now();
        let hot = TradeSignal::new(7, SignalSide::Buy, 3.2, now);
        assert_eq!(hot.strength, 1.0);
        let cold = TradeSignal::new(7, SignalSide::Sell, -0.4, now);
        assert_eq!(cold.strength, 0.0);
    }

    #[test]
    fn side_codes_round_trip() {
        assert_eq!(SignalSide::from_code(0), Some(SignalSide::Buy));
        assert_eq!(SignalSide::from_code(1), Some(SignalSide::Sell));
        assert_eq!(SignalSide::from_code(9), None);
    }

    #[test]
    fn descriptor_serializes_without_empty_fields() {
        let descriptor = StrategyDescriptor::builtin("momentum-core", "momentum");
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(!json.contains("\"source\""));
        assert!(!json.contains("submitted_by"));
    }
}
