//! Curated host surface exposed to sandboxed strategies.
//!
//! The linker defines exactly the capabilities the policy's allow set
//! names: structured logging, math helpers, point-in-time table reads,
//! config lookups, and signal emission. Nothing here touches the
//! filesystem, network, clock, or process table. Host calls degrade on bad
//! input (NaN returns, skipped writes) instead of trapping; budget
//! enforcement stays the engine's job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Engine, Extern, Linker, StoreLimits};

use crate::error::LoaderError;
use crate::traits::MarketData;
use crate::types::{EntityId, StrategyConfig};

/// Longest string a guest may hand across the boundary.
const MAX_GUEST_STRING: u32 = 4_096;

/// Most signals one guest call may buffer; emits past the cap are skipped.
/// Host heap stays bounded no matter how much fuel the guest spends.
pub(crate) const MAX_PENDING_SIGNALS: usize = 16_384;

/// Per-store state reachable from host functions.
pub(crate) struct GuestState {
    pub(crate) limits: StoreLimits,
    pub(crate) config: StrategyConfig,
    pub(crate) market: Arc<dyn MarketData>,
    /// Raw `signal.emit` captures, converted after the guest call returns.
    pub(crate) pending_signals: Vec<(EntityId, i32, f64)>,
    pub(crate) subject: String,
}

/// Build the linker with the full curated surface defined.
pub(crate) fn curated_linker(engine: &Engine) -> Result<Linker<GuestState>, LoaderError> {
    let mut linker = Linker::new(engine);
    define_surface(&mut linker).map_err(|e| LoaderError::TransientInfra {
        detail: format!("host surface setup failed: {e}"),
    })?;
    Ok(linker)
}

fn define_surface(linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "env",
        "log",
        |mut caller: Caller<'_, GuestState>, level: i32, ptr: u32, len: u32| {
            let message = read_guest_str(&mut caller, ptr, len).unwrap_or_default();
            let subject = caller.data().subject.as_str();
            match level {
                0 => debug!(target: "strategy_guest", subject, "{message}"),
                1 => info!(target: "strategy_guest", subject, "{message}"),
                _ => warn!(target: "strategy_guest", subject, "{message}"),
            }
        },
    )?;

    linker.func_wrap("math", "exp", |x: f64| x.exp())?;
    linker.func_wrap("math", "ln", |x: f64| x.ln())?;
    linker.func_wrap("math", "pow", |base: f64, exponent: f64| base.powf(exponent))?;

    linker.func_wrap(
        "data",
        "value",
        |mut caller: Caller<'_, GuestState>, entity: i64, ptr: u32, len: u32, ts: i64| -> f64 {
            let field = match read_guest_str(&mut caller, ptr, len) {
                Some(field) => field,
                None => return f64::NAN,
            };
            let as_of = match guest_timestamp(ts) {
                Some(as_of) => as_of,
                None => return f64::NAN,
            };
            caller
                .data()
                .market
                .value(entity, &field, as_of)
                .unwrap_or(f64::NAN)
        },
    )?;

    linker.func_wrap(
        "config",
        "get",
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> f64 {
            match read_guest_str(&mut caller, ptr, len) {
                Some(key) => caller.data().config.get(&key).unwrap_or(f64::NAN),
                None => f64::NAN,
            }
        },
    )?;

    linker.func_wrap(
        "config",
        "has",
        |mut caller: Caller<'_, GuestState>, ptr: u32, len: u32| -> i32 {
            match read_guest_str(&mut caller, ptr, len) {
                Some(key) => caller.data().config.contains(&key) as i32,
                None => 0,
            }
        },
    )?;

    linker.func_wrap(
        "signal",
        "emit",
        |mut caller: Caller<'_, GuestState>, entity: i64, side: i32, strength: f64| {
            let pending = &mut caller.data_mut().pending_signals;
            if pending.len() < MAX_PENDING_SIGNALS {
                pending.push((entity, side, strength));
            }
        },
    )?;

    Ok(())
}

/// Copy a guest string out of exported memory. `None` on missing memory or
/// an out-of-bounds range; length is capped rather than refused.
fn read_guest_str(caller: &mut Caller<'_, GuestState>, ptr: u32, len: u32) -> Option<String> {
    let memory = match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => memory,
        _ => return None,
    };
    let start = ptr as usize;
    let end = start.checked_add(len.min(MAX_GUEST_STRING) as usize)?;
    let bytes = memory.data(&caller).get(start..end)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn guest_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}
