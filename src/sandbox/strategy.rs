//! Strategy implementation backed by a live sandboxed instance.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::trace;
use wasmtime::{Store, Trap, TypedFunc};

use crate::audit::{AuditEventType, AuditLog, AuditSeverity};
use crate::sandbox::host::GuestState;
use crate::traits::{Strategy, StrategyError};
use crate::types::{EntityId, SignalSide, TradeSignal};

/// Fuel-usage fraction above which a resource-usage warning is recorded:
/// used * DEN >= budget * NUM, i.e. eighty percent.
const FUEL_WARN_NUM: u64 = 4;
const FUEL_WARN_DEN: u64 = 5;

/// A ready sandboxed strategy. Owns its store; every call re-arms the fuel
/// and epoch budgets so one slow call cannot starve the next.
pub struct WasmStrategy {
    name: String,
    store: Store<GuestState>,
    score_fn: TypedFunc<(i64, i64), f64>,
    signals_fn: TypedFunc<i64, ()>,
    fuel_budget: u64,
    epoch_ticks: u64,
    audit: Option<Arc<AuditLog>>,
}

impl WasmStrategy {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: String,
        store: Store<GuestState>,
        score_fn: TypedFunc<(i64, i64), f64>,
        signals_fn: TypedFunc<i64, ()>,
        fuel_budget: u64,
        epoch_ticks: u64,
        audit: Option<Arc<AuditLog>>,
    ) -> Self {
        Self {
            name,
            store,
            score_fn,
            signals_fn,
            fuel_budget,
            epoch_ticks,
            audit,
        }
    }

    fn arm_budgets(&mut self) -> Result<(), StrategyError> {
        self.store
            .set_fuel(self.fuel_budget)
            .map_err(|e| StrategyError::Trapped(e.to_string()))?;
        self.store.set_epoch_deadline(self.epoch_ticks);
        Ok(())
    }

    fn fuel_used(&self) -> u64 {
        self.fuel_budget
            .saturating_sub(self.store.get_fuel().unwrap_or(0))
    }

    fn classify(err: wasmtime::Error) -> StrategyError {
        match err.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => StrategyError::CpuExhausted,
            Some(Trap::Interrupt) => StrategyError::DeadlineExceeded,
            Some(trap) => StrategyError::Trapped(trap.to_string()),
            None => StrategyError::Trapped(
                err.to_string().lines().next().unwrap_or("unknown").to_string(),
            ),
        }
    }

    fn record_usage(&self, op: &'static str, started: Instant) {
        let fuel_used = self.fuel_used();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        trace!(strategy = %self.name, op, fuel_used, elapsed_ms, "guest call finished");

        let Some(audit) = &self.audit else { return };
        audit.record(
            AuditEventType::Execution,
            self.name.as_str(),
            AuditSeverity::Info,
            json!({"op": op, "fuel_used": fuel_used, "elapsed_ms": elapsed_ms}),
        );
        if fuel_used.saturating_mul(FUEL_WARN_DEN) >= self.fuel_budget.saturating_mul(FUEL_WARN_NUM)
        {
            audit.record(
                AuditEventType::ResourceUsage,
                self.name.as_str(),
                AuditSeverity::Warning,
                json!({"op": op, "fuel_used": fuel_used, "fuel_budget": self.fuel_budget}),
            );
        }
    }
}

impl Strategy for WasmStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&mut self, entity: EntityId, as_of: DateTime<Utc>) -> Result<f64, StrategyError> {
        let started = Instant::now();
        self.arm_budgets()?;
        match self
            .score_fn
            .call(&mut self.store, (entity, as_of.timestamp()))
        {
            Ok(score) => {
                self.record_usage("score", started);
                Ok(score)
            }
            Err(e) => Err(Self::classify(e)),
        }
    }

    fn signals(&mut self, as_of: DateTime<Utc>) -> Result<Vec<TradeSignal>, StrategyError> {
        let started = Instant::now();
        self.arm_budgets()?;
        self.store.data_mut().pending_signals.clear();

        if let Err(e) = self.signals_fn.call(&mut self.store, as_of.timestamp()) {
            return Err(Self::classify(e));
        }

        let raw = std::mem::take(&mut self.store.data_mut().pending_signals);
        let mut signals = Vec::with_capacity(raw.len());
        for (entity, side_code, strength) in raw {
            let side = SignalSide::from_code(side_code).ok_or_else(|| {
                StrategyError::Malformed(format!("signal side code {side_code}"))
            })?;
            signals.push(TradeSignal::new(entity, side, strength, as_of));
        }
        self.record_usage("signals", started);
        Ok(signals)
    }
}
