//! Execution engine: converts approved intents into exchange effects with
//! at-most-once semantics.
//!
//! Every write is preceded by an idempotency reservation, an action-dedupe
//! row, and a fresh gate evaluation. Ambiguous outcomes never retry blindly;
//! they enter the reconcile path and are resolved against what the exchange
//! actually reports.

pub mod reconcile;
pub mod replace;

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{ExecutionConfig, SafetyConfig};
use crate::domain::ids::{self, canonical_decimal};
use crate::domain::{Intent, Order, OrderDecision, OrderStatus, RiskMode, Side};
use crate::error::{LirabotError, Result};
use crate::exchange::{ExchangeTransport, LimitOrderRequest, RateLimiter};
use crate::persistence::{IdempotencyCheck, StateStore};
use crate::rules::{quantize_order, RulesProvider};
use crate::safety::{self, GateReason, RuntimeFlags};

pub use replace::ReplacePlanner;

/// Per-cycle execution context assembled by the orchestrator.
#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub cycle_id: String,
    pub mode: RiskMode,
    /// Free balances by currency code
    pub free_balances: HashMap<String, Decimal>,
    pub quote_currency: String,
}

pub struct ExecutionEngine {
    store: StateStore,
    transport: Arc<dyn ExchangeTransport>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    cfg: ExecutionConfig,
    safety: SafetyConfig,
    runtime: Arc<RwLock<RuntimeFlags>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: StateStore,
        transport: Arc<dyn ExchangeTransport>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        cfg: ExecutionConfig,
        safety: SafetyConfig,
        runtime: Arc<RwLock<RuntimeFlags>>,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            clock,
            cfg,
            safety,
            runtime,
        }
    }

    fn runtime_flags(&self) -> RuntimeFlags {
        *self.runtime.read().expect("runtime flags lock poisoned")
    }

    /// Gate evaluation immediately before a write. Returns the blocking
    /// reasons, empty when live writes are allowed.
    fn gate_check(&self) -> Vec<GateReason> {
        safety::evaluate(&self.safety, self.runtime_flags()).reasons
    }

    fn time_bucket(&self) -> i64 {
        let width_ms = self.cfg.ttl_seconds.max(1) * 1_000;
        self.clock.now().timestamp_millis() / width_ms
    }

    fn canonical_submit_payload(request: &LimitOrderRequest) -> String {
        format!(
            "submit|{}|{}|{}|{}|{}",
            request.symbol.pair(),
            request.side.as_str(),
            canonical_decimal(request.price),
            canonical_decimal(request.qty),
            request.client_order_id
        )
    }

    fn canonical_cancel_payload(client_order_id: &str) -> String {
        format!("cancel|{}", client_order_id)
    }

    // ==================== Submit path ====================

    /// Run the submit path for every admitted intent. One decision per
    /// intent, in input order; a blocked gate mid-cycle short-circuits the
    /// remaining side effects.
    pub async fn execute_intents(
        &self,
        intents: &[Intent],
        rules: &RulesProvider,
        ctx: &SubmitContext,
    ) -> Result<Vec<OrderDecision>> {
        let mut decisions = Vec::with_capacity(intents.len());
        let mut gates_closed = false;

        for intent in intents {
            if gates_closed {
                decisions.push(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: "gate_closed_mid_cycle".to_string(),
                });
                continue;
            }

            let decision = self.submit_one(intent, rules, ctx).await?;
            if let OrderDecision::Rejected { reason_code, .. } = &decision {
                // A kill-switch or safe-mode flip blocks the rest of the
                // cycle's writes, not just this intent.
                if reason_code == "gate:KILL_SWITCH" || reason_code == "gate:SAFE_MODE" {
                    gates_closed = true;
                }
            }
            decisions.push(decision);
        }

        Ok(decisions)
    }

    async fn submit_one(
        &self,
        intent: &Intent,
        rules: &RulesProvider,
        ctx: &SubmitContext,
    ) -> Result<OrderDecision> {
        let now = self.clock.now();

        // Quantize against the symbol's rules; a missing symbol skips, a
        // violated constraint rejects. Either way the cycle continues.
        let symbol_rules = match rules.get(&intent.symbol) {
            Ok(r) => r,
            Err(reject) => {
                return Ok(OrderDecision::Skipped {
                    symbol: intent.symbol.clone(),
                    reason_code: reject.code(),
                })
            }
        };
        let quantized = match quantize_order(symbol_rules, intent.target_price, intent.target_qty)
        {
            Ok(q) => q,
            Err(reject) => {
                return Ok(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: reject.code(),
                })
            }
        };

        // Balance pre-check with the safety buffer.
        if let Some(reason) = self.balance_shortfall(intent, quantized.price, quantized.qty, ctx) {
            return Ok(OrderDecision::Rejected {
                symbol: intent.symbol.clone(),
                side: intent.side,
                reason_code: reason,
            });
        }

        // Mode check before any reservation; a mode-blocked intent must not
        // burn an idempotency or dedupe slot.
        if !ctx.mode.allows_writes() || (intent.side == Side::Buy && !ctx.mode.allows_buys()) {
            return Ok(OrderDecision::Rejected {
                symbol: intent.symbol.clone(),
                side: intent.side,
                reason_code: format!("mode_{}", ctx.mode.as_str().to_ascii_lowercase()),
            });
        }

        let client_order_id = ids::client_order_id(
            &ctx.cycle_id,
            &intent.symbol,
            intent.side,
            quantized.price,
            quantized.qty,
            intent.reason,
            &intent.strategy_id,
        );

        let request = LimitOrderRequest {
            symbol: intent.symbol.clone(),
            side: intent.side,
            price: quantized.price,
            qty: quantized.qty,
            client_order_id: client_order_id.clone(),
        };
        let payload_hash = ids::payload_hash(&Self::canonical_submit_payload(&request));

        // Intent-level record (idempotency_key unique on the intent hash).
        self.store
            .record_intent(
                &client_order_id,
                &intent.hash(),
                &ctx.cycle_id,
                &serde_json::to_string(intent)?,
                now,
            )
            .await?;

        // Idempotency reservation on the client order id.
        match self
            .store
            .check_or_reserve_idempotency(&client_order_id, &payload_hash, now)
            .await?
        {
            IdempotencyCheck::Reserved => {}
            IdempotencyCheck::Duplicate => {
                debug!(%client_order_id, "duplicate submit; returning cached decision");
                return Ok(OrderDecision::Deduplicated { client_order_id });
            }
            IdempotencyCheck::Conflict { stored_hash } => {
                self.store
                    .increment_meta_counter("idempotency_conflicts")
                    .await?;
                warn!(
                    client_order_id,
                    stored = %stored_hash,
                    submitted = %payload_hash,
                    "IDEMPOTENCY_CONFLICT"
                );
                return Ok(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: "idempotency_conflict".to_string(),
                });
            }
        }

        // Action dedupe inside the time bucket.
        if !self
            .store
            .try_reserve_action("submit", &payload_hash, self.time_bucket(), now)
            .await?
        {
            debug!(%client_order_id, "submit action deduplicated in bucket");
            return Ok(OrderDecision::Deduplicated { client_order_id });
        }

        // Persist the planned order before any wire activity.
        let order = Order::planned(
            client_order_id.clone(),
            intent.symbol.clone(),
            intent.side,
            quantized.price,
            quantized.qty,
            intent.hash(),
            now,
        );
        self.store.upsert_order(&order).await?;

        // Gate recheck immediately before the write.
        let blocked = self.gate_check();
        if !blocked.is_empty() {
            if blocked.contains(&GateReason::DryRun)
                && !blocked.contains(&GateReason::KillSwitch)
                && !blocked.contains(&GateReason::SafeMode)
            {
                // Dry run: record the simulated order, no transport call.
                info!(%client_order_id, "dry-run submit simulated");
                return Ok(OrderDecision::Accepted {
                    client_order_id,
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    price: quantized.price,
                    qty: quantized.qty,
                    status: OrderStatus::Planned,
                    simulated: true,
                });
            }
            let reason = blocked[0];
            return Ok(OrderDecision::Rejected {
                symbol: intent.symbol.clone(),
                side: intent.side,
                reason_code: format!("gate:{}", reason.as_str()),
            });
        }

        if let Err(err) = self.limiter.acquire("submit_limit_order") {
            warn!(%client_order_id, %err, "THROTTLED: submit deferred to next cycle");
            return Ok(OrderDecision::Rejected {
                symbol: intent.symbol.clone(),
                side: intent.side,
                reason_code: "throttled".to_string(),
            });
        }

        self.store
            .transition_order(&client_order_id, OrderStatus::Submitted, None, now)
            .await?;

        match self.transport.submit_limit_order(&request).await {
            Ok(ack) => {
                let now = self.clock.now();
                self.store
                    .transition_order(
                        &client_order_id,
                        OrderStatus::Acked,
                        ack.exchange_order_id.as_deref(),
                        now,
                    )
                    .await?;
                self.store
                    .transition_order(&client_order_id, OrderStatus::Open, None, now)
                    .await?;
                info!(%client_order_id, "order submitted and open");
                Ok(OrderDecision::Accepted {
                    client_order_id,
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    price: quantized.price,
                    qty: quantized.qty,
                    status: OrderStatus::Open,
                    simulated: false,
                })
            }
            Err(LirabotError::Transport { kind, message, .. }) if kind.is_ambiguous() => {
                warn!(%client_order_id, %kind, message, "ambiguous submit; reconciling");
                self.store
                    .transition_order(&client_order_id, OrderStatus::Unknown, None, now)
                    .await?;
                let resolved = self.reconcile_order(&client_order_id).await?;
                match resolved {
                    Some(status) if status != OrderStatus::Unknown => Ok(OrderDecision::Accepted {
                        client_order_id,
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                        price: quantized.price,
                        qty: quantized.qty,
                        status,
                        simulated: false,
                    }),
                    _ => Ok(OrderDecision::NeedsReconcile {
                        client_order_id,
                        symbol: intent.symbol.clone(),
                        side: intent.side,
                    }),
                }
            }
            Err(LirabotError::Transport { kind, .. }) => {
                // Refused before processing (429 and friends): the order
                // never reached the book.
                self.store
                    .transition_order(&client_order_id, OrderStatus::Rejected, None, now)
                    .await?;
                Ok(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: format!("transport_{}", kind.as_str().to_ascii_lowercase()),
                })
            }
            Err(LirabotError::Exchange(message)) => {
                self.store
                    .transition_order(&client_order_id, OrderStatus::Rejected, None, now)
                    .await?;
                warn!(%client_order_id, message, "exchange rejected order");
                Ok(OrderDecision::Rejected {
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    reason_code: "exchange_reject".to_string(),
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Shortfall reason if the free balance cannot cover the order with the
    /// configured safety buffer.
    fn balance_shortfall(
        &self,
        intent: &Intent,
        price: Decimal,
        qty: Decimal,
        ctx: &SubmitContext,
    ) -> Option<String> {
        let buffer = Decimal::ONE + self.cfg.balance_buffer_ratio;
        match intent.side {
            Side::Buy => {
                let needed = price * qty * buffer;
                let free = ctx
                    .free_balances
                    .get(&ctx.quote_currency)
                    .copied()
                    .unwrap_or_default();
                (free < needed).then(|| "insufficient_balance".to_string())
            }
            Side::Sell => {
                let free = ctx
                    .free_balances
                    .get(&intent.symbol.base)
                    .copied()
                    .unwrap_or_default();
                (free < qty).then(|| "insufficient_balance".to_string())
            }
        }
    }

    // ==================== Cancel path ====================

    /// Cancel every active order past its TTL. Cancels are allowed in
    /// REDUCE_RISK_ONLY; OBSERVE_ONLY suppresses them like any write.
    pub async fn cancel_stale_orders(&self, mode: RiskMode) -> Result<Vec<OrderDecision>> {
        let now = self.clock.now();
        let mut decisions = Vec::new();

        for order in self.store.active_orders().await? {
            if order.status == OrderStatus::Unknown {
                continue; // resolved by the reconcile pass, not cancelable
            }
            if order.age_seconds(now) < self.cfg.ttl_seconds {
                continue;
            }
            decisions.push(self.cancel_order(&order, mode).await?);
        }
        Ok(decisions)
    }

    /// Cancel one order with dedupe + gate recheck. Canceling a terminal
    /// order is a no-op.
    pub async fn cancel_order(&self, order: &Order, mode: RiskMode) -> Result<OrderDecision> {
        let now = self.clock.now();
        let client_order_id = order.client_order_id.clone();

        if order.status.is_terminal() {
            return Ok(OrderDecision::Deduplicated { client_order_id });
        }

        // Mode check before the reservation so a blocked attempt does not
        // burn the dedupe slot for this bucket.
        if !mode.allows_writes() {
            return Ok(OrderDecision::Rejected {
                symbol: order.symbol.clone(),
                side: order.side,
                reason_code: "mode_observe_only".to_string(),
            });
        }

        let payload_hash = ids::payload_hash(&Self::canonical_cancel_payload(&client_order_id));
        if !self
            .store
            .try_reserve_action("cancel", &payload_hash, self.time_bucket(), now)
            .await?
        {
            return Ok(OrderDecision::Deduplicated { client_order_id });
        }

        let blocked = self.gate_check();
        if !blocked.is_empty() {
            return Ok(OrderDecision::Rejected {
                symbol: order.symbol.clone(),
                side: order.side,
                reason_code: format!("gate:{}", blocked[0].as_str()),
            });
        }

        if let Err(err) = self.limiter.acquire("cancel_order") {
            warn!(%client_order_id, %err, "THROTTLED: cancel deferred");
            return Ok(OrderDecision::Rejected {
                symbol: order.symbol.clone(),
                side: order.side,
                reason_code: "throttled".to_string(),
            });
        }

        match self
            .transport
            .cancel_order_by_client_id(&client_order_id)
            .await
        {
            Ok(_) => {
                self.store
                    .transition_order(&client_order_id, OrderStatus::Canceled, None, now)
                    .await?;
                info!(%client_order_id, "stale order canceled");
                Ok(OrderDecision::Accepted {
                    client_order_id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    price: order.price,
                    qty: order.qty,
                    status: OrderStatus::Canceled,
                    simulated: false,
                })
            }
            Err(LirabotError::Transport { kind, message, .. }) if kind.is_ambiguous() => {
                warn!(%client_order_id, %kind, message, "ambiguous cancel; reconciling");
                self.store
                    .transition_order(&client_order_id, OrderStatus::Unknown, None, now)
                    .await?;
                let _ = self.reconcile_order(&client_order_id).await?;
                Ok(OrderDecision::NeedsReconcile {
                    client_order_id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                })
            }
            Err(LirabotError::Exchange(message)) => {
                // Usually "order not found": already terminal on the
                // exchange. Leave resolution to reconcile.
                debug!(%client_order_id, message, "cancel reported unknown order");
                Ok(OrderDecision::Deduplicated { client_order_id })
            }
            Err(other) => Err(other),
        }
    }
}
