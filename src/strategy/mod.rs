//! Strategy contract and the reference take-profit strategy.
//!
//! A strategy is a pure intent producer: no I/O, no mutation, no clock
//! reads. Re-invoking with an identical context yields identical intents,
//! which is what makes cycle replay and client-order-id determinism hold.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::domain::{Balance, Intent, IntentReason, Order, Position, Side, Symbol, TopOfBook};

/// Snapshot handed to a strategy each cycle.
#[derive(Debug, Clone, Default)]
pub struct StrategyContext {
    pub universe: Vec<Symbol>,
    pub orderbooks: HashMap<Symbol, TopOfBook>,
    pub positions: HashMap<Symbol, Position>,
    pub free_balances: HashMap<String, Balance>,
    pub open_orders: Vec<Order>,
    pub params: StrategyParams,
}

/// Parameters the strategy reads; the minute-truncated cycle timestamp
/// doubles as the idempotency seed so re-runs of the same cycle propose the
/// same intents.
#[derive(Debug, Clone, Default)]
pub struct StrategyParams {
    pub min_profit_bps: Decimal,
    pub fee_bps: Decimal,
    pub slippage_bps: Decimal,
    /// Fraction of the position to offer per take-profit intent
    pub take_profit_fraction: Decimal,
    pub cycle_ts_minute: i64,
}

/// Pure intent producer.
pub trait Strategy: Send + Sync {
    fn strategy_id(&self) -> &str;

    fn generate_intents(&self, ctx: &StrategyContext) -> Vec<Intent>;
}

/// Reference strategy: offer a slice of each profitable position at the
/// best bid once the bid clears the round-trip cost threshold.
pub struct TakeProfitStrategy {
    id: String,
}

impl TakeProfitStrategy {
    pub fn new() -> Self {
        Self {
            id: "take_profit_v1".to_string(),
        }
    }
}

impl Default for TakeProfitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for TakeProfitStrategy {
    fn strategy_id(&self) -> &str {
        &self.id
    }

    fn generate_intents(&self, ctx: &StrategyContext) -> Vec<Intent> {
        let mut intents = Vec::new();
        let bps_denominator = Decimal::from(10_000);

        for symbol in &ctx.universe {
            let Some(position) = ctx.positions.get(symbol) else {
                continue;
            };
            if position.qty <= Decimal::ZERO || position.avg_cost <= Decimal::ZERO {
                continue;
            }
            let Some(top) = ctx.orderbooks.get(symbol) else {
                continue;
            };

            let threshold_bps = (ctx.params.fee_bps
                + ctx.params.slippage_bps
                + ctx.params.min_profit_bps)
                / bps_denominator;
            let required = position.avg_cost * (Decimal::ONE + threshold_bps);
            if top.best_bid < required {
                continue;
            }

            let qty = (position.qty * ctx.params.take_profit_fraction).normalize();
            if qty <= Decimal::ZERO {
                continue;
            }

            intents.push(Intent {
                symbol: symbol.clone(),
                side: Side::Sell,
                target_price: top.best_bid,
                target_qty: qty,
                reason: IntentReason::TakeProfit,
                strategy_id: self.id.clone(),
                idempotency_seed: format!("{}|{}", symbol.pair(), ctx.params.cycle_ts_minute),
            });
        }

        intents
    }
}
