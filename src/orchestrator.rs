//! Cycle orchestrator.
//!
//! Runs exactly one cycle in the invariant order: gates, fetch, reconcile,
//! accounting, risk, strategy, filters, execute, persist. Integrity errors
//! abort before the cycle commit. The orchestrator never retries a cycle on
//! its own; the scheduler re-invokes it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::domain::{
    ids, sort_intents, Balance, CycleOutcome, CycleRecord, Intent, OrderDecision, RiskMode, Side,
    Symbol, TopOfBook,
};
use crate::error::{LirabotError, Result};
use crate::exchange::{with_retries, ExchangeTransport, RateLimiter, RetryPolicy};
use crate::execution::{ExecutionEngine, ReplacePlanner, SubmitContext};
use crate::ledger::AccountingLedger;
use crate::persistence::StateStore;
use crate::risk::{self, FilterContext, FilterVerdict, ModeInputs, PrevModeState};
use crate::rules::RulesProvider;
use crate::safety::{self, RuntimeFlags};
use crate::strategy::{Strategy, StrategyContext, StrategyParams};

const PREV_MODE_KEY: &str = "risk_prev_mode";
const COOLDOWN_UNTIL_KEY: &str = "risk_cooldown_until_ms";
const LOSS_STREAK_KEY: &str = "loss_streak";
const PARAM_VERSION_KEY: &str = "active_param_version";

pub struct CycleOrchestrator {
    config: AppConfig,
    store: StateStore,
    transport: Arc<dyn ExchangeTransport>,
    strategy: Arc<dyn Strategy>,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    ledger: AccountingLedger,
    engine: ExecutionEngine,
    runtime: Arc<RwLock<RuntimeFlags>>,
    retry: RetryPolicy,
}

impl CycleOrchestrator {
    pub async fn new(
        config: AppConfig,
        store: StateStore,
        transport: Arc<dyn ExchangeTransport>,
        strategy: Arc<dyn Strategy>,
        clock: Arc<dyn Clock>,
        runtime: Arc<RwLock<RuntimeFlags>>,
    ) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config.transport));
        let ledger =
            AccountingLedger::load(store.clone(), config.agent.quote_currency.clone()).await?;
        let engine = ExecutionEngine::new(
            store.clone(),
            transport.clone(),
            limiter.clone(),
            clock.clone(),
            config.execution.clone(),
            config.safety.clone(),
            runtime.clone(),
        );
        let retry = RetryPolicy::from_config(&config.transport);
        Ok(Self {
            config,
            store,
            transport,
            strategy,
            clock,
            limiter,
            ledger,
            engine,
            runtime,
            retry,
        })
    }

    pub fn universe(&self) -> Vec<Symbol> {
        self.config
            .agent
            .universe
            .iter()
            .map(|base| Symbol::new(base.as_str(), self.config.agent.quote_currency.as_str()))
            .collect()
    }

    fn runtime_flags(&self) -> RuntimeFlags {
        *self.runtime.read().expect("runtime flags lock poisoned")
    }

    /// Deterministic cycle identity. The per-minute sequence only advances
    /// on a committed cycle, so a crashed attempt re-derives the same id
    /// and every duplicate-protection key still matches.
    async fn derive_cycle_id(&self, ts: DateTime<Utc>) -> Result<(String, i64, String)> {
        let ts_minute = ts.timestamp() / 60;
        let seq_cursor = format!("cycle_seq:{}", ts_minute);
        let counter = self
            .store
            .cursor(&seq_cursor)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let cycle_id = ids::cycle_id(ts_minute, &self.config.agent.process_role, counter);
        Ok((cycle_id, counter, seq_cursor))
    }

    // ==================== Fetch stage ====================

    async fn fetch_balances(&self) -> Result<Vec<Balance>> {
        self.limiter.acquire("get_balances")?;
        let transport = self.transport.clone();
        with_retries(self.retry, "get_balances", || {
            let transport = transport.clone();
            async move { transport.get_balances().await }
        })
        .await
    }

    async fn fetch_orderbooks(&self, universe: &[Symbol]) -> HashMap<Symbol, TopOfBook> {
        let mut books = HashMap::new();
        for symbol in universe {
            if self.limiter.acquire("get_orderbook").is_err() {
                warn!(symbol = %symbol, "THROTTLED: orderbook fetch deferred");
                continue;
            }
            let transport = self.transport.clone();
            let sym = symbol.clone();
            match with_retries(self.retry, "get_orderbook", || {
                let transport = transport.clone();
                let sym = sym.clone();
                async move { transport.get_orderbook(&sym).await }
            })
            .await
            {
                Ok(top) => {
                    books.insert(symbol.clone(), top);
                }
                Err(err) => warn!(symbol = %symbol, %err, "orderbook unavailable this cycle"),
            }
        }
        books
    }

    async fn fetch_rules(&self, universe: &[Symbol]) -> RulesProvider {
        if self.limiter.acquire("get_exchange_info").is_err() {
            warn!("THROTTLED: exchange info fetch deferred");
            return RulesProvider::new(self.config.rules.rules_invalid_metadata_policy);
        }
        let transport = self.transport.clone();
        match with_retries(self.retry, "get_exchange_info", || {
            let transport = transport.clone();
            async move { transport.get_exchange_info().await }
        })
        .await
        {
            Ok(info) => {
                let metadata: HashMap<Symbol, serde_json::Value> = info.into_iter().collect();
                RulesProvider::from_metadata(universe, &metadata, &self.config.rules)
            }
            Err(err) => {
                warn!(%err, "exchange info unavailable; rules missing for all symbols");
                let mut provider =
                    RulesProvider::new(self.config.rules.rules_invalid_metadata_policy);
                for symbol in universe {
                    provider.insert(symbol.clone(), crate::rules::RulesStatus::Missing);
                }
                provider
            }
        }
    }

    /// Pull new fills per symbol and ingest them under the authoritative
    /// transaction, advancing the per-symbol cursor with the same commit.
    async fn ingest_recent_fills(
        &mut self,
        universe: &[Symbol],
        marks: &HashMap<Symbol, Decimal>,
    ) -> Result<()> {
        for symbol in universe {
            let cursor_name = format!("fills_cursor:{}", symbol.storage_key());
            let since_ms = self
                .store
                .cursor(&cursor_name)
                .await?
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or_else(|| {
                    (self.clock.now() - chrono::Duration::hours(24)).timestamp_millis()
                });

            if self.limiter.acquire("get_recent_fills").is_err() {
                warn!(symbol = %symbol, "THROTTLED: fills fetch deferred");
                continue;
            }
            let transport = self.transport.clone();
            let sym = symbol.clone();
            let fills = match with_retries(self.retry, "get_recent_fills", || {
                let transport = transport.clone();
                let sym = sym.clone();
                async move { transport.get_recent_fills(&sym, since_ms).await }
            })
            .await
            {
                Ok(fills) => fills,
                Err(err) => {
                    warn!(symbol = %symbol, %err, "fills unavailable this cycle");
                    continue;
                }
            };

            if fills.is_empty() {
                continue;
            }
            let next_cursor = fills
                .iter()
                .map(|f| f.traded_at.timestamp_millis())
                .max()
                .unwrap_or(since_ms)
                + 1;
            self.ledger
                .ingest_fills(&fills, marks, Some((&cursor_name, &next_cursor.to_string())))
                .await?;
        }
        Ok(())
    }

    // ==================== Risk stage ====================

    async fn prev_mode_state(&self) -> Result<PrevModeState> {
        let mode = self
            .store
            .meta(PREV_MODE_KEY)
            .await?
            .and_then(|v| v.parse::<RiskMode>().ok());
        let cooldown_until = self
            .store
            .meta(COOLDOWN_UNTIL_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);
        Ok(PrevModeState {
            mode,
            cooldown_until,
        })
    }

    async fn save_mode_state(&self, decision: &crate::domain::RiskDecision) -> Result<()> {
        self.store
            .set_meta(PREV_MODE_KEY, decision.mode.as_str())
            .await?;
        match decision.cooldown_until {
            Some(until) => {
                self.store
                    .set_meta(COOLDOWN_UNTIL_KEY, &until.timestamp_millis().to_string())
                    .await?
            }
            None => self.store.set_meta(COOLDOWN_UNTIL_KEY, "0").await?,
        }
        Ok(())
    }

    /// Track the realized-PnL loss streak across capital checkpoints.
    async fn update_loss_streak(&self, realized_delta: Decimal) -> Result<u32> {
        let mut streak = self
            .store
            .meta(LOSS_STREAK_KEY)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if realized_delta < Decimal::ZERO {
            streak += 1;
        } else if realized_delta > Decimal::ZERO {
            streak = 0;
        }
        self.store
            .set_meta(LOSS_STREAK_KEY, &streak.to_string())
            .await?;
        Ok(streak)
    }

    // ==================== The cycle ====================

    pub async fn run_one_cycle(&mut self) -> Result<CycleOutcome> {
        let started = std::time::Instant::now();
        let now = self.clock.now();
        let universe = self.universe();

        // Stage 1: gates. A blocked gate never stops planning; it only
        // suppresses side effects downstream.
        let gate_decision = safety::evaluate(&self.config.safety, self.runtime_flags());
        if gate_decision.blocked() {
            debug!(reasons = ?gate_decision.reason_codes(), "gates closed; planning only");
        }

        // Stage 2: deterministic cycle identity.
        let (cycle_id, counter, seq_cursor) = self.derive_cycle_id(now).await?;
        info!(cycle_id = %cycle_id, "cycle start");

        // Stage 3: fetch balances, books, rules.
        let balances = self.fetch_balances().await?;
        let free_balances: HashMap<String, Decimal> = balances
            .iter()
            .map(|b| (b.currency.to_ascii_uppercase(), b.free))
            .collect();
        let orderbooks = self.fetch_orderbooks(&universe).await;
        let marks: HashMap<Symbol, Decimal> = orderbooks
            .iter()
            .map(|(s, top)| (s.clone(), top.mid()))
            .collect();
        let rules = self.fetch_rules(&universe).await;

        // Stage 4: reconcile open orders, then ingest fills.
        let reconcile_summary = self.engine.reconcile_unknown_orders().await?;
        if reconcile_summary.closed_unknown > 0 {
            warn!(
                closed = reconcile_summary.closed_unknown,
                "orders closed as unknown this cycle"
            );
        }
        self.ingest_recent_fills(&universe, &marks).await?;

        // Stage 5: accounting.
        let baselines = self.ledger.day_baselines(now.date_naive()).await?;
        let prev_peak = self.ledger.load_peak_equity().await?;
        let cash = free_balances
            .get(&self.config.agent.quote_currency)
            .copied()
            .unwrap_or_default();
        let metrics = self.ledger.metrics(&marks, cash, baselines, prev_peak);
        self.ledger.save_peak_equity(metrics.peak_equity_try).await?;

        // Capital checkpoint precedes the mode decision so budgets reflect
        // this cycle's realized PnL.
        let capital = match self.store.capital_state().await? {
            Some(state) => state,
            None => crate::domain::CapitalState::bootstrap(
                self.config.capital.initial_trading_capital_try,
                now,
            ),
        };
        let capital = match risk::checkpoint(
            &capital,
            self.ledger.realized_total(),
            self.ledger.event_count(),
            &self.config.capital,
            now,
        ) {
            Ok(Some((next, change))) => {
                self.update_loss_streak(change.realized_delta_try).await?;
                self.store
                    .save_capital_checkpoint(&next, Some(&change))
                    .await?;
                next
            }
            Ok(None) => {
                // First cycle ever still needs the bootstrap row.
                if self.store.capital_state().await?.is_none() {
                    self.store.save_capital_checkpoint(&capital, None).await?;
                }
                capital
            }
            Err(integrity) => return Err(integrity.into()),
        };

        // Stage 6: risk mode.
        let positions: HashMap<Symbol, crate::domain::Position> = self
            .ledger
            .state()
            .symbols()
            .into_iter()
            .map(|s| {
                let mark = marks.get(&s).copied();
                let position = self.ledger.state().position(&s, mark);
                (s, position)
            })
            .collect();

        let gross_exposure: Decimal = positions
            .iter()
            .map(|(s, p)| p.qty * marks.get(s).copied().unwrap_or_default())
            .sum();
        let largest_position_pct = if metrics.equity_try > Decimal::ZERO {
            positions
                .iter()
                .map(|(s, p)| p.qty * marks.get(s).copied().unwrap_or_default())
                .max()
                .unwrap_or_default()
                / metrics.equity_try
        } else {
            Decimal::ZERO
        };
        let market_data_age_ms = universe
            .iter()
            .map(|s| {
                orderbooks
                    .get(s)
                    .map(|top| top.age_ms(now))
                    .unwrap_or(i64::MAX)
            })
            .max()
            .unwrap_or(i64::MAX);
        let max_spread_bps = orderbooks
            .values()
            .map(|top| top.spread_bps())
            .max()
            .unwrap_or_default();
        let loss_streak = self
            .store
            .meta(LOSS_STREAK_KEY)
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);

        let inputs = ModeInputs {
            kill_switch_blocked: gate_decision
                .reasons
                .contains(&crate::safety::GateReason::KillSwitch),
            drawdown: metrics.max_drawdown,
            realized_today_try: metrics.realized_today_try,
            fees_today_try: metrics.fees_today_try,
            gross_exposure_try: gross_exposure,
            largest_position_pct,
            consecutive_loss_streak: loss_streak,
            market_data_age_ms,
            max_spread_bps,
            unknown_escalation_active: self.engine.unknown_escalation_active().await?,
            rules_force_observe_only: rules.forces_observe_only(),
        };
        let risk_decision = risk::decide_mode(
            &inputs,
            &self.config.risk,
            self.prev_mode_state().await?,
            self.config.transport.market_data_max_age_ms,
            now,
        );
        self.save_mode_state(&risk_decision).await?;
        let mode = risk_decision.mode;

        // Stage 7: strategy (pure).
        let strategy_ctx = StrategyContext {
            universe: universe.clone(),
            orderbooks: orderbooks.clone(),
            positions: positions.clone(),
            free_balances: balances
                .iter()
                .map(|b| (b.currency.to_ascii_uppercase(), b.clone()))
                .collect(),
            open_orders: self.store.active_orders().await?,
            params: StrategyParams {
                min_profit_bps: self.config.risk.min_profit_bps,
                fee_bps: self.config.risk.fee_bps_taker,
                slippage_bps: self.config.risk.slippage_bps_buffer,
                take_profit_fraction: Decimal::new(25, 2),
                cycle_ts_minute: now.timestamp() / 60,
            },
        };
        let mut intents = self.strategy.generate_intents(&strategy_ctx);
        sort_intents(&mut intents);

        // Stage 8: risk filters + quantization context.
        let mut open_orders_per_symbol = HashMap::new();
        for symbol in &universe {
            open_orders_per_symbol
                .insert(symbol.clone(), self.store.count_open_orders(symbol).await?);
        }
        let mut last_intent_ts = HashMap::new();
        for symbol in &universe {
            for side in [Side::Buy, Side::Sell] {
                let name = last_intent_cursor(symbol, side);
                if let Some(ts) = self
                    .store
                    .cursor(&name)
                    .await?
                    .and_then(|v| v.parse::<i64>().ok())
                    .and_then(DateTime::from_timestamp_millis)
                {
                    last_intent_ts.insert((symbol.clone(), side), ts);
                }
            }
        }

        let filter_ctx = FilterContext {
            mode,
            open_orders_per_symbol,
            last_intent_ts,
            positions: positions.clone(),
            free_cash_try: cash,
            cash_reserve_try: self.config.capital.cash_reserve_target_try,
            budget: Some(risk::budget_limits(capital.trading_capital_try, mode)),
            now,
        };
        let verdicts = risk::apply_filters(intents.clone(), &filter_ctx, &self.config.risk);

        // Stage 9: execute. Stale cancels first, then continuations of
        // earlier replaces, then route this cycle's admitted intents: a
        // group that already has a live order becomes a replace, the rest
        // submit directly in stable order.
        let cancel_decisions = self.engine.cancel_stale_orders(mode).await?;

        let submit_ctx = SubmitContext {
            cycle_id: cycle_id.clone(),
            mode,
            free_balances: free_balances.clone(),
            quote_currency: self.config.agent.quote_currency.clone(),
        };
        let replace_continuations = self
            .engine
            .process_pending_replaces(&rules, &submit_ctx)
            .await?;

        let admitted: Vec<Intent> = verdicts
            .iter()
            .filter_map(|v| v.admitted().cloned())
            .collect();

        // Oldest live order per (symbol, side) group; UNKNOWN orders freeze
        // their group entirely.
        let mut open_by_group: HashMap<(Symbol, Side), crate::domain::Order> = HashMap::new();
        let mut unknown_groups: HashSet<(Symbol, Side)> = HashSet::new();
        for order in self.store.active_orders().await? {
            let key = (order.symbol.clone(), order.side);
            if order.status == crate::domain::OrderStatus::Unknown {
                unknown_groups.insert(key);
            } else {
                open_by_group.entry(key).or_insert(order);
            }
        }

        let mut admitted_decisions: Vec<Option<OrderDecision>> = vec![None; admitted.len()];
        let mut planner = ReplacePlanner::new();
        let mut direct: Vec<(usize, Intent)> = Vec::new();
        for (slot, intent) in admitted.iter().enumerate() {
            let key = (intent.symbol.clone(), intent.side);
            if unknown_groups.contains(&key) {
                admitted_decisions[slot] = Some(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: "unknown_order_freeze".to_string(),
                });
                continue;
            }
            match open_by_group.get(&key) {
                Some(existing)
                    if existing.price == intent.target_price
                        && existing.qty == intent.target_qty =>
                {
                    // The live order already expresses this intent.
                    admitted_decisions[slot] = Some(OrderDecision::Deduplicated {
                        client_order_id: existing.client_order_id.clone(),
                    });
                }
                Some(existing) => {
                    planner.request(existing.client_order_id.clone(), intent.clone());
                    admitted_decisions[slot] = Some(OrderDecision::ReplacePending {
                        old_client_order_id: existing.client_order_id.clone(),
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                    });
                }
                None => direct.push((slot, intent.clone())),
            }
        }

        let replace_starts = if planner.is_empty() {
            Vec::new()
        } else {
            self.engine.start_replaces(planner, mode).await?
        };

        let direct_intents: Vec<Intent> = direct.iter().map(|(_, i)| i.clone()).collect();
        let submit_decisions = self
            .engine
            .execute_intents(&direct_intents, &rules, &submit_ctx)
            .await?;

        for decision in &submit_decisions {
            if let OrderDecision::Accepted { symbol, side, .. } = decision {
                self.store
                    .set_cursor(
                        &last_intent_cursor(symbol, *side),
                        &now.timestamp_millis().to_string(),
                    )
                    .await?;
            }
        }
        for ((slot, _), decision) in direct.iter().zip(submit_decisions.into_iter()) {
            admitted_decisions[*slot] = Some(decision);
        }

        // Interleave filter rejects and execution decisions back into the
        // intents' order for the trace.
        let mut admitted_iter = admitted_decisions.into_iter();
        let order_decisions: Vec<OrderDecision> = verdicts
            .iter()
            .map(|verdict| match verdict {
                FilterVerdict::Admitted(_) => admitted_iter
                    .next()
                    .flatten()
                    .unwrap_or_else(|| unreachable!("one decision per admitted intent")),
                FilterVerdict::Rejected {
                    intent,
                    reason_code,
                } => OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: reason_code.clone(),
                },
            })
            .collect();

        let orders_canceled = cancel_decisions
            .iter()
            .chain(replace_starts.iter())
            .filter(|d| d.is_accepted())
            .count();
        let orders_submitted = order_decisions
            .iter()
            .chain(replace_continuations.iter())
            .filter(|d| d.is_accepted())
            .count();
        let rejects = order_decisions
            .len()
            .saturating_sub(order_decisions.iter().filter(|d| d.is_accepted()).count())
            + replace_continuations
                .iter()
                .filter(|d| !d.is_accepted())
                .count();

        // Stage 10: persist the cycle atomically (best-effort relative to
        // the authoritative ledger transaction, which already committed).
        let param_version = self
            .store
            .meta(PARAM_VERSION_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let record = CycleRecord {
            cycle_id: cycle_id.clone(),
            ts: now,
            selected_universe: universe,
            risk_decision: risk_decision.clone(),
            intents,
            order_decisions,
            ledger_metrics: metrics,
            active_param_version: param_version,
        };
        if let Err(err) = self.store.persist_cycle(&record).await {
            error!(cycle_id = %cycle_id, %err, "cycle persistence failed at cycle_trace");
            return Err(LirabotError::Internal(format!(
                "persist:cycle_trace: {}",
                err
            )));
        }
        self.store
            .set_cursor(&seq_cursor, &(counter + 1).to_string())
            .await?;

        let outcome = CycleOutcome {
            cycle_id,
            mode,
            intents_proposed: record.intents.len(),
            orders_submitted,
            orders_canceled,
            rejects,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            cycle_id = %outcome.cycle_id,
            mode = %outcome.mode,
            submitted = outcome.orders_submitted,
            canceled = outcome.orders_canceled,
            rejects = outcome.rejects,
            "cycle complete"
        );
        Ok(outcome)
    }
}

fn last_intent_cursor(symbol: &Symbol, side: Side) -> String {
    format!("last_intent:{}:{}", symbol.storage_key(), side.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_intent_cursor_is_scoped_by_symbol_and_side() {
        let btc = Symbol::try_base("BTC");
        assert_eq!(last_intent_cursor(&btc, Side::Buy), "last_intent:BTC/TRY:BUY");
        assert_ne!(
            last_intent_cursor(&btc, Side::Buy),
            last_intent_cursor(&btc, Side::Sell)
        );
    }
}
