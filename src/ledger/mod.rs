//! Event-sourced accounting ledger.
//!
//! Fills become `FILL` (+`FEE`) events with deterministic ids; positions and
//! PnL are derived exclusively by reducing the event stream. Ingest is
//! validated against a candidate state before anything is written, so an
//! oversell aborts with no partial durable state.

pub mod integrity;
pub mod reduce;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::domain::ids;
use crate::domain::{Fill, LedgerEvent, LedgerEventKind, LedgerMetrics, Position, Side, Symbol};
use crate::error::Result;
use crate::persistence::StateStore;

pub use reduce::{reduce_all, Lot, ReducedState, SLIPPAGE_META_PREFIX};

/// Result of one fill-ingest batch.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub fills_seen: usize,
    pub fills_applied: usize,
    pub events_appended: usize,
}

/// Day-start baselines for `realized_today` / `fees_today`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DayBaselines {
    pub realized_try: Decimal,
    pub fees_try: Decimal,
}

/// Canonical accounting state, checkpointed incrementally.
pub struct AccountingLedger {
    store: StateStore,
    quote_currency: String,
    state: ReducedState,
}

impl AccountingLedger {
    /// Build the ledger and replay the full event stream once.
    pub async fn load(store: StateStore, quote_currency: impl Into<String>) -> Result<Self> {
        let quote_currency = quote_currency.into();
        let events = store.all_events().await?;
        let state = reduce_all(events.iter(), &quote_currency)?;
        info!(events = state.event_count, "ledger replayed");
        Ok(Self {
            store,
            quote_currency,
            state,
        })
    }

    pub fn state(&self) -> &ReducedState {
        &self.state
    }

    pub fn event_count(&self) -> i64 {
        self.state.event_count
    }

    pub fn realized_total(&self) -> Decimal {
        self.state.realized_total()
    }

    /// Apply events persisted since the last checkpoint (crash recovery and
    /// cross-process catch-up). Incremental replay must land on the same
    /// state a full replay produces.
    pub async fn refresh(&mut self) -> Result<()> {
        let newer = self.store.events_after(self.state.event_count).await?;
        if newer.is_empty() {
            return Ok(());
        }
        for event in &newer {
            self.state.apply(event, &self.quote_currency)?;
        }
        debug!(applied = newer.len(), "ledger checkpoint advanced");
        Ok(())
    }

    /// Realized slippage for one fill against the originating order's limit
    /// price, adverse positive. `None` when the fill has no known order.
    async fn fill_slippage(&self, fill: &Fill) -> Result<Option<Decimal>> {
        let Some(coid) = fill.client_order_id.as_deref() else {
            return Ok(None);
        };
        let Some(order) = self.store.get_order(coid).await? else {
            return Ok(None);
        };
        let slip = match fill.side {
            Side::Buy => (fill.price - order.price) * fill.qty,
            Side::Sell => (order.price - fill.price) * fill.qty,
        };
        Ok(Some(slip.normalize()))
    }

    /// Build the ledger events for one fill.
    fn events_for_fill(&self, fill: &Fill, slippage: Option<Decimal>) -> Vec<LedgerEvent> {
        let synthetic = fill.fill_id.starts_with("synthetic:");
        let exchange_trade_id = (!synthetic).then(|| fill.fill_id.clone());
        let slippage_meta = slippage.filter(|s| !s.is_zero()).map(|s| {
            format!(
                "{}{}",
                SLIPPAGE_META_PREFIX,
                crate::domain::ids::canonical_decimal(s)
            )
        });

        let mut events = vec![LedgerEvent {
            event_id: ids::fill_event_id(&fill.fill_id),
            ts: fill.traded_at,
            kind: LedgerEventKind::Fill,
            symbol: Some(fill.symbol.clone()),
            side: Some(fill.side),
            qty: fill.qty,
            price: fill.price,
            fee_amount: Decimal::ZERO,
            fee_currency: None,
            exchange_trade_id,
            client_order_id: fill.client_order_id.clone(),
            meta: slippage_meta,
        }];

        if fill.has_fee() {
            let foreign = !fill
                .fee_currency
                .eq_ignore_ascii_case(&self.quote_currency);
            let meta = foreign.then(|| {
                format!(
                    "fee_conversion_missing:{}",
                    fill.fee_currency.to_ascii_uppercase()
                )
            });
            if let Some(tag) = &meta {
                warn!(fill_id = %fill.fill_id, tag = %tag, "non-quote fee recorded unconverted");
            }
            events.push(LedgerEvent {
                event_id: ids::fee_event_id(&fill.fill_id),
                ts: fill.traded_at,
                kind: LedgerEventKind::Fee,
                symbol: Some(fill.symbol.clone()),
                side: None,
                qty: Decimal::ZERO,
                price: Decimal::ZERO,
                fee_amount: fill.fee_amount,
                fee_currency: Some(fill.fee_currency.to_ascii_uppercase()),
                exchange_trade_id: None,
                client_order_id: fill.client_order_id.clone(),
                meta,
            });
        }

        events
    }

    /// Ingest a batch of fills under one authoritative transaction: fill
    /// rows, ledger events, applied markers, position snapshot, and cursor
    /// advance commit together. Oversell aborts before any write.
    pub async fn ingest_fills(
        &mut self,
        fills: &[Fill],
        marks: &HashMap<Symbol, Decimal>,
        cursor: Option<(&str, &str)>,
    ) -> Result<IngestReport> {
        // Catch up with anything persisted outside this process first.
        self.refresh().await?;

        let mut report = IngestReport {
            fills_seen: fills.len(),
            ..Default::default()
        };

        // Validate against a candidate state before opening the transaction.
        let mut candidate = self.state.clone();
        let mut pending: Vec<(Fill, Vec<LedgerEvent>)> = Vec::new();
        for fill in fills {
            let fill = fill.clone().with_fallback_id();
            if self.store.is_fill_applied(&fill.fill_id).await? {
                continue;
            }
            let slippage = self.fill_slippage(&fill).await?;
            let events = self.events_for_fill(&fill, slippage);
            for event in &events {
                candidate.apply(event, &self.quote_currency)?;
            }
            pending.push((fill, events));
        }

        if pending.is_empty() {
            if let Some((name, value)) = cursor {
                self.store.set_cursor(name, value).await?;
            }
            return Ok(report);
        }

        let positions = snapshot_positions(&candidate, marks);

        let mut tx = self.store.begin().await?;
        for (fill, events) in &pending {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO fills
                    (fill_id, order_id, client_order_id, symbol, side, price, qty,
                     fee_amount, fee_currency, traded_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(&fill.fill_id)
            .bind(&fill.order_id)
            .bind(&fill.client_order_id)
            .bind(fill.symbol.storage_key())
            .bind(fill.side.as_str())
            .bind(crate::persistence::dec_to_db(fill.price))
            .bind(crate::persistence::dec_to_db(fill.qty))
            .bind(crate::persistence::dec_to_db(fill.fee_amount))
            .bind(&fill.fee_currency)
            .bind(fill.traded_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;

            for event in events {
                if StateStore::append_event_tx(&mut tx, event).await? {
                    report.events_appended += 1;
                }
            }

            sqlx::query("INSERT OR IGNORE INTO applied_fills (fill_id) VALUES (?1)")
                .bind(&fill.fill_id)
                .execute(&mut *tx)
                .await?;
            report.fills_applied += 1;
        }

        StateStore::replace_positions_tx(&mut tx, &positions).await?;

        if let Some((name, value)) = cursor {
            StateStore::set_cursor_tx(&mut tx, name, value).await?;
        }

        tx.commit().await?;
        self.state = candidate;

        info!(
            applied = report.fills_applied,
            events = report.events_appended,
            "fills ingested"
        );
        Ok(report)
    }

    /// Derived metrics against current marks and cash.
    pub fn metrics(
        &self,
        marks: &HashMap<Symbol, Decimal>,
        cash_try: Decimal,
        baselines: DayBaselines,
        prev_peak_equity: Decimal,
    ) -> LedgerMetrics {
        let unrealized: Decimal = self
            .state
            .symbols()
            .iter()
            .map(|s| {
                self.state
                    .position(s, marks.get(s).copied())
                    .unrealized_pnl_try
            })
            .sum();

        let market_value: Decimal = self
            .state
            .symbols()
            .iter()
            .map(|s| self.state.qty(s) * marks.get(s).copied().unwrap_or_default())
            .sum();

        let realized_total = self.state.realized_total();
        let gross = realized_total + unrealized;
        let fees_total = self.state.fees_try;
        let slippage = self.state.slippage_try;
        let equity = cash_try + market_value;
        let peak = prev_peak_equity.max(equity);
        let max_drawdown = if peak > Decimal::ZERO {
            (Decimal::ONE - equity / peak).normalize()
        } else {
            Decimal::ZERO
        };

        LedgerMetrics {
            realized_total_try: realized_total.normalize(),
            realized_today_try: (realized_total - baselines.realized_try).normalize(),
            unrealized_try: unrealized.normalize(),
            fees_total_try: fees_total.normalize(),
            fees_today_try: (fees_total - baselines.fees_try).normalize(),
            slippage_try: slippage.normalize(),
            gross_pnl_try: gross.normalize(),
            net_pnl_try: (gross - fees_total - slippage).normalize(),
            equity_try: equity.normalize(),
            peak_equity_try: peak.normalize(),
            max_drawdown,
            event_count: self.state.event_count,
        }
    }

    /// Roll the daily baselines at UTC date change and return the active
    /// ones. Baselines live in `cursors` so restarts keep the same day
    /// window.
    pub async fn day_baselines(&self, today: NaiveDate) -> Result<DayBaselines> {
        let stored_date = self.store.cursor("day_baseline_date").await?;
        if stored_date.as_deref() == Some(&today.to_string()) {
            let realized = self
                .store
                .cursor("day_baseline_realized")
                .await?
                .map(|v| crate::persistence::dec_from_db(&v))
                .transpose()?
                .unwrap_or_default();
            let fees = self
                .store
                .cursor("day_baseline_fees")
                .await?
                .map(|v| crate::persistence::dec_from_db(&v))
                .transpose()?
                .unwrap_or_default();
            return Ok(DayBaselines {
                realized_try: realized,
                fees_try: fees,
            });
        }

        // New UTC day: today's deltas start from the current totals.
        let baselines = DayBaselines {
            realized_try: self.state.realized_total(),
            fees_try: self.state.fees_try,
        };
        self.store
            .set_cursor("day_baseline_date", &today.to_string())
            .await?;
        self.store
            .set_cursor(
                "day_baseline_realized",
                &crate::persistence::dec_to_db(baselines.realized_try),
            )
            .await?;
        self.store
            .set_cursor(
                "day_baseline_fees",
                &crate::persistence::dec_to_db(baselines.fees_try),
            )
            .await?;
        info!(date = %today, "daily baselines rolled");
        Ok(baselines)
    }

    /// Peak equity is cumulative and never reset; persisted in `meta`.
    pub async fn load_peak_equity(&self) -> Result<Decimal> {
        Ok(self
            .store
            .meta("peak_equity_try")
            .await?
            .map(|v| crate::persistence::dec_from_db(&v))
            .transpose()?
            .unwrap_or_default())
    }

    pub async fn save_peak_equity(&self, peak: Decimal) -> Result<()> {
        self.store
            .set_meta("peak_equity_try", &crate::persistence::dec_to_db(peak))
            .await
    }
}

/// Positions snapshot for persistence, covering every symbol the reducer
/// knows about.
pub fn snapshot_positions(
    state: &ReducedState,
    marks: &HashMap<Symbol, Decimal>,
) -> Vec<(Symbol, Position)> {
    state
        .symbols()
        .into_iter()
        .map(|symbol| {
            let mark = marks.get(&symbol).copied();
            let position = state.position(&symbol, mark);
            (symbol, position)
        })
        .collect()
}
