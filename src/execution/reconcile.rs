//! Uncertain-outcome reconciliation.
//!
//! An order whose write call ended ambiguously sits in UNKNOWN and is probed
//! against `get_order` / `openOrders` / `allOrders` with exponential backoff,
//! bounded by an attempt budget and a wall-clock ceiling. Exhausting the
//! budget closes the order as UNKNOWN_CLOSED and feeds the escalation latch
//! that forces the agent into OBSERVE_ONLY until an operator acknowledges.

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::domain::OrderStatus;
use crate::error::Result;
use crate::exchange::ExchangeOrder;

use super::ExecutionEngine;

/// Meta keys for the escalation latch.
pub const UNKNOWN_CLOSED_TOTAL_KEY: &str = "unknown_closed_total";
pub const UNKNOWN_ESCALATION_ACK_KEY: &str = "unknown_escalation_ack";

/// Summary of one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub probed: usize,
    pub resolved: usize,
    pub closed_unknown: usize,
}

impl ExecutionEngine {
    /// Map an exchange-reported order to our status model.
    fn map_exchange_status(order: &ExchangeOrder) -> OrderStatus {
        match order.status.parse::<OrderStatus>() {
            Ok(status) => status,
            Err(_) => {
                warn!(raw = %order.status, "unrecognized exchange status");
                OrderStatus::Unknown
            }
        }
    }

    /// One bounded probe for a single order. Returns the resolved status,
    /// or `Some(Unknown)` when the exchange answered but did not know the
    /// order, or `None` when every query failed.
    pub(super) async fn reconcile_order(
        &self,
        client_order_id: &str,
    ) -> Result<Option<OrderStatus>> {
        let now = self.clock.now();

        // Direct lookup first.
        if self.limiter.acquire("get_order").is_ok() {
            if let Ok(Some(found)) = self.transport.get_order(None, Some(client_order_id)).await {
                let status = Self::map_exchange_status(&found);
                if status != OrderStatus::Unknown {
                    self.store
                        .transition_order(
                            client_order_id,
                            status,
                            Some(&found.exchange_order_id),
                            now,
                        )
                        .await?;
                    info!(client_order_id, resolved = %status, "order reconciled");
                    return Ok(Some(status));
                }
            }
        }

        // Open orders: an order resting on the book is OPEN.
        if self.limiter.acquire("get_open_orders").is_ok() {
            if let Ok(open) = self.transport.get_open_orders(None).await {
                if let Some(found) = open
                    .iter()
                    .find(|o| o.client_order_id.as_deref() == Some(client_order_id))
                {
                    let status = if found.executed_qty > rust_decimal::Decimal::ZERO {
                        OrderStatus::PartiallyFilled
                    } else {
                        OrderStatus::Open
                    };
                    self.store
                        .transition_order(
                            client_order_id,
                            status,
                            Some(&found.exchange_order_id),
                            now,
                        )
                        .await?;
                    info!(client_order_id, resolved = %status, "order reconciled via openOrders");
                    return Ok(Some(status));
                }
            }
        }

        // All orders in a window around the order's creation.
        if let Some(order) = self.store.get_order(client_order_id).await? {
            if self.limiter.acquire("get_all_orders").is_ok() {
                let start = (order.created_at - Duration::minutes(10)).timestamp_millis();
                let end = (now + Duration::minutes(1)).timestamp_millis();
                if let Ok(all) = self
                    .transport
                    .get_all_orders(&order.symbol, start, end)
                    .await
                {
                    if let Some(found) = all
                        .iter()
                        .find(|o| o.client_order_id.as_deref() == Some(client_order_id))
                    {
                        let status = Self::map_exchange_status(found);
                        if status != OrderStatus::Unknown {
                            self.store
                                .transition_order(
                                    client_order_id,
                                    status,
                                    Some(&found.exchange_order_id),
                                    now,
                                )
                                .await?;
                            info!(client_order_id, resolved = %status, "order reconciled via allOrders");
                            return Ok(Some(status));
                        }
                    } else {
                        // The exchange answered and does not know the order;
                        // keep UNKNOWN and let the attempt budget decide.
                        debug!(client_order_id, "order absent from allOrders window");
                        return Ok(Some(OrderStatus::Unknown));
                    }
                }
            }
        }

        Ok(None)
    }

    /// Probe every UNKNOWN order, close the ones past their budget, and
    /// refresh the escalation latch.
    pub async fn reconcile_unknown_orders(&self) -> Result<ReconcileSummary> {
        let now = self.clock.now();
        let mut summary = ReconcileSummary::default();

        for order in self.store.active_orders().await? {
            if order.status != OrderStatus::Unknown {
                continue;
            }
            summary.probed += 1;

            // Exponential backoff between probes, anchored at the moment
            // the order went UNKNOWN.
            let backoff_secs = 1i64 << order.reconcile_attempts.min(8);
            let due = order.updated_at + Duration::seconds(backoff_secs);
            if now < due {
                continue;
            }

            let over_budget = order.reconcile_attempts >= self.cfg.max_reconcile_attempts
                || order.age_seconds(now) > self.cfg.reconcile_ceiling_seconds;
            if over_budget {
                self.store
                    .transition_order(
                        &order.client_order_id,
                        OrderStatus::UnknownClosed,
                        None,
                        now,
                    )
                    .await?;
                let total = self
                    .store
                    .increment_meta_counter(UNKNOWN_CLOSED_TOTAL_KEY)
                    .await?;
                summary.closed_unknown += 1;
                warn!(
                    client_order_id = %order.client_order_id,
                    attempts = order.reconcile_attempts,
                    total_closed = total,
                    "reconcile budget exhausted; order closed as unknown"
                );
                continue;
            }

            let attempts = self
                .store
                .bump_reconcile_attempts(&order.client_order_id)
                .await?;
            match self.reconcile_order(&order.client_order_id).await? {
                Some(status) if status != OrderStatus::Unknown => summary.resolved += 1,
                _ => {
                    debug!(
                        client_order_id = %order.client_order_id,
                        attempts,
                        "order still unknown"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Whether the escalation latch is active: more orders have closed as
    /// UNKNOWN than the threshold, and the operator has not acknowledged the
    /// current count. Clearing is manual: write the latch value into
    /// `unknown_escalation_ack`.
    pub async fn unknown_escalation_active(&self) -> Result<bool> {
        let total = self
            .store
            .meta(UNKNOWN_CLOSED_TOTAL_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        if total < self.cfg.unknown_order_escalation_threshold {
            return Ok(false);
        }
        let acked = self
            .store
            .meta(UNKNOWN_ESCALATION_ACK_KEY)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(acked < total)
    }
}
