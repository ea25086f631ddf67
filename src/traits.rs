//! The strategy abstraction shared by sandboxed and trusted code.
//!
//! The backtesting engine only ever sees [`Strategy`] trait objects; where
//! the code came from is invisible past the load boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{EntityId, TradeSignal};

/// Point-in-time access to the research tables.
///
/// Implementations must answer as of the requested date and never leak
/// future rows; lookahead bugs here poison every backtest upstream.
pub trait MarketData: Send + Sync {
    /// Value of `field` for `entity` as of `as_of`, or `None` when the
    /// table has no row.
    fn value(&self, entity: EntityId, field: &str, as_of: DateTime<Utc>) -> Option<f64>;

    /// Entities present in the tables, for strategies that scan the whole
    /// universe.
    fn entities(&self) -> Vec<EntityId>;
}

/// Execution failures surfaced by a loaded strategy.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("execution trapped: {0}")]
    Trapped(String),

    #[error("cpu budget exhausted")]
    CpuExhausted,

    #[error("wall deadline exceeded")]
    DeadlineExceeded,

    #[error("malformed guest response: {0}")]
    Malformed(String),
}

/// A loaded, ready-to-run strategy.
///
/// Calls take `&mut self`: a strategy instance is stateful and single
/// threaded by contract, with sharing handled by [`SharedStrategy`].
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Attractiveness score for one entity as of a date. Higher is better;
    /// NaN means the strategy has no opinion.
    fn score(&mut self, entity: EntityId, as_of: DateTime<Utc>) -> Result<f64, StrategyError>;

    /// Signals over the whole universe as of a date.
    fn signals(&mut self, as_of: DateTime<Utc>) -> Result<Vec<TradeSignal>, StrategyError>;
}

/// Handle given out by the loader: cheap to clone, serialized access.
pub type SharedStrategy = Arc<tokio::sync::Mutex<Box<dyn Strategy>>>;

/// Wrap a freshly loaded strategy for shared use.
pub fn share(strategy: Box<dyn Strategy>) -> SharedStrategy {
    Arc::new(tokio::sync::Mutex::new(strategy))
}
