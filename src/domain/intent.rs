use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::ids;
use super::market::{Side, Symbol};

/// Why a strategy proposed this trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentReason {
    TakeProfit,
    Entry,
    Rebalance,
    Close,
}

impl IntentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentReason::TakeProfit => "take_profit",
            IntentReason::Entry => "entry",
            IntentReason::Rebalance => "rebalance",
            IntentReason::Close => "close",
        }
    }
}

impl std::fmt::Display for IntentReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for IntentReason {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim() {
            "take_profit" => Ok(IntentReason::TakeProfit),
            "entry" => Ok(IntentReason::Entry),
            "rebalance" => Ok(IntentReason::Rebalance),
            "close" => Ok(IntentReason::Close),
            _ => Err("invalid intent reason"),
        }
    }
}

/// A strategy-proposed trade, before risk filtering and quantization.
/// Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub symbol: Symbol,
    pub side: Side,
    pub target_price: Decimal,
    pub target_qty: Decimal,
    pub reason: IntentReason,
    pub strategy_id: String,
    pub idempotency_seed: String,
}

impl Intent {
    pub fn notional(&self) -> Decimal {
        self.target_price * self.target_qty
    }

    /// Hash over the identifying fields; equal intents hash equal.
    pub fn hash(&self) -> String {
        ids::intent_hash(
            &self.symbol,
            self.side,
            self.target_price,
            self.target_qty,
            self.reason,
            &self.strategy_id,
            &self.idempotency_seed,
        )
    }
}

/// Stable ordering for intents within a cycle: `(symbol, side, hash)`.
pub fn sort_intents(intents: &mut [Intent]) {
    intents.sort_by(|a, b| {
        a.symbol
            .cmp(&b.symbol)
            .then(a.side.cmp(&b.side))
            .then_with(|| a.hash().cmp(&b.hash()))
    });
}
