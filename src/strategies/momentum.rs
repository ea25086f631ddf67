//! Cross-sectional momentum over the research tables.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::trace;

use crate::traits::{MarketData, Strategy, StrategyError};
use crate::types::{EntityId, SignalSide, StrategyConfig, TradeSignal};

const DEFAULT_LOOKBACK_DAYS: f64 = 20.0;
const DEFAULT_ENTRY_THRESHOLD: f64 = 0.05;
const DEFAULT_EXIT_THRESHOLD: f64 = 0.05;

/// Trailing-return momentum: score is the fractional price change over the
/// lookback window, signals fire when it clears the entry/exit thresholds.
pub struct MomentumStrategy {
    market: Arc<dyn MarketData>,
    lookback: Duration,
    entry_threshold: f64,
    exit_threshold: f64,
}

impl MomentumStrategy {
    pub fn new(config: &StrategyConfig, market: Arc<dyn MarketData>) -> Self {
        let lookback_days = config
            .get_or("lookback_days", DEFAULT_LOOKBACK_DAYS)
            .max(1.0) as i64;
        Self {
            market,
            lookback: Duration::days(lookback_days),
            entry_threshold: config.get_or("entry_threshold", DEFAULT_ENTRY_THRESHOLD),
            exit_threshold: config.get_or("exit_threshold", DEFAULT_EXIT_THRESHOLD),
        }
    }

    fn trailing_return(&self, entity: EntityId, as_of: DateTime<Utc>) -> f64 {
        let now = self.market.value(entity, "close", as_of);
        let then = self.market.value(entity, "close", as_of - self.lookback);
        match (now, then) {
            (Some(now), Some(then)) if then > 0.0 => now / then - 1.0,
            _ => f64::NAN,
        }
    }
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn score(&mut self, entity: EntityId, as_of: DateTime<Utc>) -> Result<f64, StrategyError> {
        Ok(self.trailing_return(entity, as_of))
    }

    fn signals(&mut self, as_of: DateTime<Utc>) -> Result<Vec<TradeSignal>, StrategyError> {
        let mut signals = Vec::new();
        for entity in self.market.entities() {
            let momentum = self.trailing_return(entity, as_of);
            if !momentum.is_finite() {
                continue;
            }
            let side = if momentum >= self.entry_threshold {
                SignalSide::Buy
            } else if momentum <= -self.exit_threshold {
                SignalSide::Sell
            } else {
                continue;
            };
            trace!(entity, momentum, %side, "momentum signal");
            signals.push(TradeSignal::new(entity, side, momentum.abs(), as_of));
        }
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Prices move linearly per entity: slope is +1/day for odd entities
    /// and -1/day for even ones, anchored at 200 on the epoch date.
    struct LinearMarket {
        anchor: DateTime<Utc>,
        entities: Vec<EntityId>,
    }

    impl MarketData for LinearMarket {
        fn value(&self, entity: EntityId, field: &str, as_of: DateTime<Utc>) -> Option<f64> {
            if field != "close" {
                return None;
            }
            let days = (as_of - self.anchor).num_days() as f64;
            let slope = if entity % 2 == 0 { -1.0 } else { 1.0 };
            Some(200.0 + slope * days)
        }

        fn entities(&self) -> Vec<EntityId> {
            self.entities.clone()
        }
    }

    fn market() -> (Arc<LinearMarket>, DateTime<Utc>) {
        let anchor = Utc::now();
        let market = Arc::new(LinearMarket {
            anchor,
            entities: vec![1, 2],
        });
        (market, anchor + Duration::days(40))
    }

    #[test]
    fn score_is_the_trailing_return() {
        let (market, as_of) = market();
        let mut strategy = MomentumStrategy::new(&StrategyConfig::new(), market);

        // Entity 1: 240 now vs 220 twenty days ago.
        let score = strategy.score(1, as_of).unwrap();
        assert!((score - (240.0 / 220.0 - 1.0)).abs() < 1e-12);

        // Entity 2 is falling, so the score is negative.
        assert!(strategy.score(2, as_of).unwrap() < 0.0);
    }

    #[test]
    fn signals_split_rising_and_falling_entities() {
        let (market, as_of) = market();
        let config = StrategyConfig::new()
            .set("entry_threshold", 0.05)
            .set("exit_threshold", 0.05);
        let mut strategy = MomentumStrategy::new(&config, market);

        let signals = strategy.signals(as_of).unwrap();
        assert_eq!(signals.len(), 2);

        let buy = signals.iter().find(|s| s.entity == 1).unwrap();
        assert_eq!(buy.side, SignalSide::Buy);
        let sell = signals.iter().find(|s| s.entity == 2).unwrap();
        assert_eq!(sell.side, SignalSide::Sell);
    }

    #[test]
    fn thresholds_gate_weak_momentum() {
        let (market, as_of) = market();
        let config = StrategyConfig::new()
            .set("entry_threshold", 0.5)
            .set("exit_threshold", 0.5);
        let mut strategy = MomentumStrategy::new(&config, market);
        assert!(strategy.signals(as_of).unwrap().is_empty());
    }

    #[test]
    fn missing_data_yields_no_opinion() {
        struct EmptyMarket;
        impl MarketData for EmptyMarket {
            fn value(&self, _: EntityId, _: &str, _: DateTime<Utc>) -> Option<f64> {
                None
            }
            fn entities(&self) -> Vec<EntityId> {
                vec![9]
            }
        }

        let mut strategy = MomentumStrategy::new(&StrategyConfig::new(), Arc::new(EmptyMarket));
        assert!(strategy.score(9, Utc::now()).unwrap().is_nan());
        assert!(strategy.signals(Utc::now()).unwrap().is_empty());
    }
}
