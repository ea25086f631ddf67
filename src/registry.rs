//! Explicit registry of trusted builtin strategies.
//!
//! Builtins are registered by name at startup; resolution is a map lookup,
//! with no dynamic discovery in the load path. An unknown name is a
//! contract violation, same as a sandboxed module missing an export.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{LoaderError, LoaderResult};
use crate::strategies::MomentumStrategy;
use crate::traits::{MarketData, Strategy};
use crate::types::StrategyConfig;

/// Builds one strategy instance from config and market access.
pub type StrategyFactory =
    Arc<dyn Fn(&StrategyConfig, Arc<dyn MarketData>) -> LoaderResult<Box<dyn Strategy>> + Send + Sync>;

pub struct StrategyRegistry {
    factories: DashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry preloaded with the platform's builtin strategies.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("momentum", |config, market| {
            Ok(Box::new(MomentumStrategy::new(config, market)) as Box<dyn Strategy>)
        });
        registry
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&StrategyConfig, Arc<dyn MarketData>) -> LoaderResult<Box<dyn Strategy>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn instantiate(
        &self,
        name: &str,
        config: &StrategyConfig,
        market: Arc<dyn MarketData>,
    ) -> LoaderResult<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LoaderError::ContractViolation {
                construct: name.to_string(),
                detail: "no builtin strategy registered under this name".into(),
            })?;
        factory(config, market)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
