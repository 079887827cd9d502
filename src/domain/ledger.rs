use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::market::{Side, Symbol};

/// Append-only accounting record kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEventKind {
    Fill,
    Fee,
    Adjustment,
    Rebalance,
    Transfer,
    Withdrawal,
}

impl LedgerEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEventKind::Fill => "FILL",
            LedgerEventKind::Fee => "FEE",
            LedgerEventKind::Adjustment => "ADJUSTMENT",
            LedgerEventKind::Rebalance => "REBALANCE",
            LedgerEventKind::Transfer => "TRANSFER",
            LedgerEventKind::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl std::fmt::Display for LedgerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LedgerEventKind {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FILL" => Ok(LedgerEventKind::Fill),
            "FEE" => Ok(LedgerEventKind::Fee),
            "ADJUSTMENT" => Ok(LedgerEventKind::Adjustment),
            "REBALANCE" => Ok(LedgerEventKind::Rebalance),
            "TRANSFER" => Ok(LedgerEventKind::Transfer),
            "WITHDRAWAL" => Ok(LedgerEventKind::Withdrawal),
            _ => Err("invalid ledger event kind"),
        }
    }
}

/// One append-only accounting event. `event_id` is deterministic and unique;
/// ingest is INSERT OR IGNORE on it.
///
/// Invariants: `FEE` events carry `qty = 0` and `side = None`; `FILL` events
/// carry a side and a positive qty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: String,
    pub ts: DateTime<Utc>,
    pub kind: LedgerEventKind,
    pub symbol: Option<Symbol>,
    pub side: Option<Side>,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee_amount: Decimal,
    pub fee_currency: Option<String>,
    pub exchange_trade_id: Option<String>,
    pub client_order_id: Option<String>,
    /// Free-form audit tags, e.g. `fee_conversion_missing:USDT`
    pub meta: Option<String>,
}

impl LedgerEvent {
    /// Check the per-kind field invariants before persisting.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.kind {
            LedgerEventKind::Fill => {
                if self.side.is_none() {
                    return Err(format!("FILL event {} missing side", self.event_id));
                }
                if self.qty <= Decimal::ZERO {
                    return Err(format!("FILL event {} qty must be > 0", self.event_id));
                }
                if self.symbol.is_none() {
                    return Err(format!("FILL event {} missing symbol", self.event_id));
                }
            }
            LedgerEventKind::Fee => {
                if !self.qty.is_zero() {
                    return Err(format!("FEE event {} must carry qty=0", self.event_id));
                }
                if self.side.is_some() {
                    return Err(format!("FEE event {} must carry side=None", self.event_id));
                }
            }
            LedgerEventKind::Adjustment => {
                if self.symbol.is_none() {
                    return Err(format!("ADJUSTMENT event {} missing symbol", self.event_id));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Derived per-symbol snapshot. Never persisted directly; always rebuilt by
/// reducing ledger events in `(ts, event_id)` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub qty: Decimal,
    pub avg_cost: Decimal,
    pub realized_pnl_try: Decimal,
    pub unrealized_pnl_try: Decimal,
}

/// Ledger-wide derived metrics snapshot, persisted per cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerMetrics {
    pub realized_total_try: Decimal,
    pub realized_today_try: Decimal,
    pub unrealized_try: Decimal,
    pub fees_total_try: Decimal,
    pub fees_today_try: Decimal,
    /// Realized slippage: fill price vs. the order's limit price, adverse
    /// positive
    pub slippage_try: Decimal,
    pub gross_pnl_try: Decimal,
    pub net_pnl_try: Decimal,
    pub equity_try: Decimal,
    pub peak_equity_try: Decimal,
    pub max_drawdown: Decimal,
    pub event_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn event(kind: LedgerEventKind) -> LedgerEvent {
        LedgerEvent {
            event_id: "e1".into(),
            ts: Utc::now(),
            kind,
            symbol: Some(Symbol::try_base("BTC")),
            side: Some(Side::Buy),
            qty: dec!(1),
            price: dec!(100),
            fee_amount: Decimal::ZERO,
            fee_currency: None,
            exchange_trade_id: None,
            client_order_id: None,
            meta: None,
        }
    }

    #[test]
    fn fee_event_rejects_qty_and_side() {
        let mut fee = event(LedgerEventKind::Fee);
        assert!(fee.validate().is_err(), "qty=1 + side should fail");

        fee.qty = Decimal::ZERO;
        assert!(fee.validate().is_err(), "side still set");

        fee.side = None;
        assert!(fee.validate().is_ok());
    }

    #[test]
    fn fill_event_requires_side_and_positive_qty() {
        let mut fill = event(LedgerEventKind::Fill);
        assert!(fill.validate().is_ok());

        fill.qty = Decimal::ZERO;
        assert!(fill.validate().is_err());

        fill.qty = dec!(1);
        fill.side = None;
        assert!(fill.validate().is_err());
    }

    #[test]
    fn kind_round_trips() {
        for kind in [
            LedgerEventKind::Fill,
            LedgerEventKind::Fee,
            LedgerEventKind::Adjustment,
            LedgerEventKind::Rebalance,
            LedgerEventKind::Transfer,
            LedgerEventKind::Withdrawal,
        ] {
            assert_eq!(kind.as_str().parse::<LedgerEventKind>().unwrap(), kind);
        }
    }
}
