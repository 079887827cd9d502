//! Self-financing capital policy.
//!
//! Positive realized PnL deltas split between tradable capital and the
//! treasury bucket; losses hit tradable capital only. Checkpoints are keyed
//! to the ledger's event count: same count is a no-op, a lower count means
//! the ledger went backwards and the cycle aborts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use crate::config::CapitalConfig;
use crate::domain::{CapitalChange, CapitalState, RiskMode};
use crate::error::IntegrityError;

/// Gross-exposure budget as a multiple of trading capital.
const EXPOSURE_CAPITAL_RATIO: Decimal = Decimal::from_parts(5, 0, 0, false, 0);
/// Per-order notional budget as a fraction of trading capital.
const ORDER_NOTIONAL_CAPITAL_RATIO: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5

/// Risk budget derived from trading capital and the active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_exposure_try: Decimal,
    pub max_order_notional_try: Decimal,
}

/// Mode multiplier: Normal trades the full budget, ReduceRiskOnly half,
/// ObserveOnly none.
fn mode_multiplier(mode: RiskMode) -> Decimal {
    match mode {
        RiskMode::Normal => Decimal::ONE,
        RiskMode::ReduceRiskOnly => Decimal::new(5, 1),
        RiskMode::ObserveOnly => Decimal::ZERO,
    }
}

pub fn budget_limits(trading_capital_try: Decimal, mode: RiskMode) -> BudgetLimits {
    let multiplier = mode_multiplier(mode);
    BudgetLimits {
        max_exposure_try: (trading_capital_try * EXPOSURE_CAPITAL_RATIO * multiplier).normalize(),
        max_order_notional_try: (trading_capital_try * ORDER_NOTIONAL_CAPITAL_RATIO * multiplier)
            .normalize(),
    }
}

/// Apply one checkpoint. Returns `None` when the event count has not moved.
pub fn checkpoint(
    state: &CapitalState,
    realized_total_try: Decimal,
    event_count: i64,
    cfg: &CapitalConfig,
    now: DateTime<Utc>,
) -> Result<Option<(CapitalState, CapitalChange)>, IntegrityError> {
    if event_count == state.last_event_count {
        return Ok(None);
    }
    if event_count < state.last_event_count {
        return Err(IntegrityError::NonMonotonicLedger {
            stored: state.last_event_count,
            observed: event_count,
        });
    }

    let delta = realized_total_try - state.last_realized_pnl_total_try;
    let (trading_delta, treasury_delta) = if delta > Decimal::ZERO {
        (
            (delta * cfg.profit_compound_ratio).normalize(),
            (delta * cfg.profit_treasury_ratio).normalize(),
        )
    } else {
        (delta, Decimal::ZERO)
    };

    let next = CapitalState {
        trading_capital_try: (state.trading_capital_try + trading_delta).normalize(),
        treasury_try: (state.treasury_try + treasury_delta).normalize(),
        last_realized_pnl_total_try: realized_total_try.normalize(),
        last_event_count: event_count,
        updated_at: now,
    };
    let change = CapitalChange {
        ts: now,
        realized_delta_try: delta.normalize(),
        trading_delta_try: trading_delta,
        treasury_delta_try: treasury_delta,
        event_count,
    };

    if !delta.is_zero() {
        info!(
            realized_delta = %delta,
            trading = %next.trading_capital_try,
            treasury = %next.treasury_try,
            "capital checkpoint applied"
        );
    }
    Ok(Some((next, change)))
}
