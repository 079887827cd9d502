//! Pure FIFO reduction of the ledger event stream.
//!
//! No I/O and no clock reads happen here; the reducer is a fold over events
//! in `(ts, event_id)` order. Selling more than the open lots cover is a
//! hard integrity failure, never a clamp.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};

use crate::domain::{LedgerEvent, LedgerEventKind, Position, Side, Symbol};
use crate::error::IntegrityError;

/// One open buy lot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lot {
    pub qty: Decimal,
    pub cost_basis: Decimal,
}

/// Accumulated accounting state. Cloneable so incremental and full replay
/// can be compared bit-for-bit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReducedState {
    lots: BTreeMap<Symbol, VecDeque<Lot>>,
    realized: BTreeMap<Symbol, Decimal>,
    /// Quote-currency fees, accumulated
    pub fees_try: Decimal,
    /// Fees in other currencies, recorded but never converted
    pub fees_foreign: BTreeMap<String, Decimal>,
    /// Realized slippage in quote currency, adverse positive. Carried on
    /// FILL events so replay reproduces it.
    pub slippage_try: Decimal,
    /// Events applied so far
    pub event_count: i64,
}

/// Meta tag prefix on FILL events carrying the realized slippage for that
/// fill.
pub const SLIPPAGE_META_PREFIX: &str = "slippage_try:";

impl ReducedState {
    /// Apply one event. The caller feeds events in replay order.
    pub fn apply(
        &mut self,
        event: &LedgerEvent,
        quote_currency: &str,
    ) -> Result<(), IntegrityError> {
        match event.kind {
            LedgerEventKind::Fill => {
                let symbol = event
                    .symbol
                    .clone()
                    .ok_or_else(|| IntegrityError::Schema("FILL without symbol".into()))?;
                let side = event
                    .side
                    .ok_or_else(|| IntegrityError::Schema("FILL without side".into()))?;
                match side {
                    Side::Buy => self.apply_buy(symbol, event.qty, event.price),
                    Side::Sell => self.apply_sell(symbol, event.qty, event.price)?,
                }
                if let Some(slip) = event
                    .meta
                    .as_deref()
                    .and_then(|m| m.strip_prefix(SLIPPAGE_META_PREFIX))
                    .and_then(|raw| raw.parse::<Decimal>().ok())
                {
                    self.slippage_try += slip;
                }
            }
            LedgerEventKind::Fee => {
                let currency = event.fee_currency.as_deref().unwrap_or(quote_currency);
                if currency.eq_ignore_ascii_case(quote_currency) {
                    self.fees_try += event.fee_amount;
                } else {
                    *self
                        .fees_foreign
                        .entry(currency.to_ascii_uppercase())
                        .or_default() += event.fee_amount;
                }
            }
            LedgerEventKind::Adjustment => {
                let symbol = event
                    .symbol
                    .clone()
                    .ok_or_else(|| IntegrityError::Schema("ADJUSTMENT without symbol".into()))?;
                if event.qty >= Decimal::ZERO {
                    self.apply_buy(symbol, event.qty, event.price);
                } else {
                    self.apply_sell(symbol, -event.qty, event.price)?;
                }
            }
            // Cash-side events; no lot effect.
            LedgerEventKind::Rebalance
            | LedgerEventKind::Transfer
            | LedgerEventKind::Withdrawal => {}
        }
        self.event_count += 1;
        Ok(())
    }

    fn apply_buy(&mut self, symbol: Symbol, qty: Decimal, price: Decimal) {
        if qty.is_zero() {
            return;
        }
        self.lots.entry(symbol).or_default().push_back(Lot {
            qty,
            cost_basis: price,
        });
    }

    fn apply_sell(
        &mut self,
        symbol: Symbol,
        qty: Decimal,
        price: Decimal,
    ) -> Result<(), IntegrityError> {
        let lots = self.lots.entry(symbol.clone()).or_default();
        let available: Decimal = lots.iter().map(|l| l.qty).sum();
        if qty > available {
            return Err(IntegrityError::Oversell {
                symbol: symbol.pair(),
                requested: qty,
                available,
            });
        }

        let mut remaining = qty;
        let mut realized = Decimal::ZERO;
        while remaining > Decimal::ZERO {
            // The availability check above guarantees a lot is present.
            let Some(lot) = lots.front_mut() else {
                break;
            };
            let take = remaining.min(lot.qty);
            realized += take * (price - lot.cost_basis);
            lot.qty -= take;
            remaining -= take;
            if lot.qty.is_zero() {
                lots.pop_front();
            }
        }

        *self.realized.entry(symbol).or_default() += realized;
        Ok(())
    }

    /// Open quantity for a symbol.
    pub fn qty(&self, symbol: &Symbol) -> Decimal {
        self.lots
            .get(symbol)
            .map(|lots| lots.iter().map(|l| l.qty).sum())
            .unwrap_or_default()
    }

    /// Weighted average cost of the remaining lots.
    pub fn avg_cost(&self, symbol: &Symbol) -> Decimal {
        let Some(lots) = self.lots.get(symbol) else {
            return Decimal::ZERO;
        };
        let qty: Decimal = lots.iter().map(|l| l.qty).sum();
        if qty.is_zero() {
            return Decimal::ZERO;
        }
        let cost: Decimal = lots.iter().map(|l| l.qty * l.cost_basis).sum();
        (cost / qty).normalize()
    }

    pub fn realized(&self, symbol: &Symbol) -> Decimal {
        self.realized.get(symbol).copied().unwrap_or_default()
    }

    pub fn realized_total(&self) -> Decimal {
        self.realized.values().copied().sum()
    }

    /// Symbols with open lots or realized history.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self
            .lots
            .keys()
            .chain(self.realized.keys())
            .cloned()
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols
    }

    /// Derived position snapshot for one symbol against a mark price.
    pub fn position(&self, symbol: &Symbol, mark: Option<Decimal>) -> Position {
        let qty = self.qty(symbol);
        let avg_cost = self.avg_cost(symbol);
        let unrealized = match mark {
            Some(mark) if !qty.is_zero() => (qty * (mark - avg_cost)).normalize(),
            _ => Decimal::ZERO,
        };
        Position {
            qty,
            avg_cost,
            realized_pnl_try: self.realized(symbol).normalize(),
            unrealized_pnl_try: unrealized,
        }
    }
}

/// Full replay: fold every event from scratch.
pub fn reduce_all<'a>(
    events: impl IntoIterator<Item = &'a LedgerEvent>,
    quote_currency: &str,
) -> Result<ReducedState, IntegrityError> {
    let mut state = ReducedState::default();
    for event in events {
        state.apply(event, quote_currency)?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn btc() -> Symbol {
        Symbol::try_base("BTC")
    }

    fn fill(id: &str, side: Side, qty: Decimal, price: Decimal, ts_s: i64) -> LedgerEvent {
        LedgerEvent {
            event_id: format!("fill:{}", id),
            ts: Utc.timestamp_opt(1_700_000_000 + ts_s, 0).unwrap(),
            kind: LedgerEventKind::Fill,
            symbol: Some(btc()),
            side: Some(side),
            qty,
            price,
            fee_amount: Decimal::ZERO,
            fee_currency: None,
            exchange_trade_id: Some(id.to_string()),
            client_order_id: None,
            meta: None,
        }
    }

    fn fee(id: &str, amount: Decimal, currency: &str, ts_s: i64) -> LedgerEvent {
        LedgerEvent {
            event_id: format!("fee:{}", id),
            ts: Utc.timestamp_opt(1_700_000_000 + ts_s, 0).unwrap(),
            kind: LedgerEventKind::Fee,
            symbol: Some(btc()),
            side: None,
            qty: Decimal::ZERO,
            price: Decimal::ZERO,
            fee_amount: amount,
            fee_currency: Some(currency.to_string()),
            exchange_trade_id: None,
            client_order_id: None,
            meta: None,
        }
    }

    #[test]
    fn fifo_matches_oldest_lots_first() {
        let events = [
            fill("1", Side::Buy, dec!(1), dec!(100), 0),
            fill("2", Side::Buy, dec!(1), dec!(200), 1),
            fill("3", Side::Sell, dec!(1.5), dec!(300), 2),
        ];
        let state = reduce_all(events.iter(), "TRY").unwrap();
        // 1 @ 100 -> +200, 0.5 @ 200 -> +50
        assert_eq!(state.realized(&btc()), dec!(250));
        assert_eq!(state.qty(&btc()), dec!(0.5));
        assert_eq!(state.avg_cost(&btc()), dec!(200));
    }

    #[test]
    fn oversell_raises_integrity_error() {
        let events = [
            fill("1", Side::Buy, dec!(1), dec!(1000000), 0),
            fill("2", Side::Sell, dec!(1.5), dec!(1050000), 1),
        ];
        let err = reduce_all(events.iter(), "TRY").unwrap_err();
        match err {
            IntegrityError::Oversell {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, dec!(1.5));
                assert_eq!(available, dec!(1));
            }
            other => panic!("expected oversell, got {:?}", other),
        }
    }

    #[test]
    fn sell_from_empty_book_is_oversell() {
        let events = [fill("1", Side::Sell, dec!(0.1), dec!(100), 0)];
        assert!(matches!(
            reduce_all(events.iter(), "TRY").unwrap_err(),
            IntegrityError::Oversell { .. }
        ));
    }

    #[test]
    fn quote_fees_accumulate_foreign_fees_segregate() {
        let events = [
            fill("1", Side::Buy, dec!(1), dec!(100), 0),
            fee("1", dec!(0.18), "TRY", 0),
            fee("x", dec!(0.002), "BNB", 1),
        ];
        let state = reduce_all(events.iter(), "TRY").unwrap();
        assert_eq!(state.fees_try, dec!(0.18));
        assert_eq!(state.fees_foreign.get("BNB"), Some(&dec!(0.002)));
    }

    #[test]
    fn incremental_replay_equals_full_replay() {
        let events = [
            fill("1", Side::Buy, dec!(2), dec!(100), 0),
            fee("1", dec!(0.2), "TRY", 0),
            fill("2", Side::Sell, dec!(0.5), dec!(150), 1),
            fill("3", Side::Buy, dec!(1), dec!(120), 2),
            fill("4", Side::Sell, dec!(2), dec!(130), 3),
        ];

        let full = reduce_all(events.iter(), "TRY").unwrap();

        let mut incremental = reduce_all(events[..2].iter(), "TRY").unwrap();
        for event in &events[2..] {
            incremental.apply(event, "TRY").unwrap();
        }

        assert_eq!(full, incremental);
        assert_eq!(full.event_count, 5);
    }

    #[test]
    fn avg_cost_is_weighted_over_remaining_lots() {
        let events = [
            fill("1", Side::Buy, dec!(1), dec!(100), 0),
            fill("2", Side::Buy, dec!(3), dec!(200), 1),
        ];
        let state = reduce_all(events.iter(), "TRY").unwrap();
        assert_eq!(state.avg_cost(&btc()), dec!(175));
    }

    #[test]
    fn position_snapshot_carries_unrealized() {
        let events = [fill("1", Side::Buy, dec!(0.01), dec!(1000000), 0)];
        let state = reduce_all(events.iter(), "TRY").unwrap();
        let pos = state.position(&btc(), Some(dec!(1010000)));
        assert_eq!(pos.qty, dec!(0.01));
        assert_eq!(pos.avg_cost, dec!(1000000));
        assert_eq!(pos.unrealized_pnl_try, dec!(100));
    }

    #[test]
    fn slippage_meta_accumulates_signed() {
        let mut adverse = fill("1", Side::Buy, dec!(1), dec!(100.5), 0);
        adverse.meta = Some("slippage_try:0.5".to_string());
        let mut favorable = fill("2", Side::Buy, dec!(1), dec!(99.9), 1);
        favorable.meta = Some("slippage_try:-0.1".to_string());
        let untagged = fill("3", Side::Buy, dec!(1), dec!(100), 2);

        let state = reduce_all([adverse, favorable, untagged].iter(), "TRY").unwrap();
        assert_eq!(state.slippage_try, dec!(0.4));
    }

    #[test]
    fn negative_adjustment_reduces_like_a_sell() {
        let buy = fill("1", Side::Buy, dec!(1), dec!(100), 0);
        let adjustment = {
            let mut e = fill("2", Side::Buy, dec!(0), dec!(0), 1);
            e.kind = LedgerEventKind::Adjustment;
            e.side = None;
            e.qty = dec!(-0.4);
            e.price = dec!(110);
            e.event_id = "adj:1".into();
            e
        };
        let state = reduce_all([buy, adjustment].iter(), "TRY").unwrap();
        assert_eq!(state.qty(&btc()), dec!(0.6));
        assert_eq!(state.realized(&btc()), dec!(4));
    }
}
