//! Replace: cancel-then-submit under one transactional id.
//!
//! The replacement submit is deferred until the canceled order is confirmed
//! terminal; while waiting, the pair sits in `pending_cancel`. Any UNKNOWN
//! order freezes new replace submits, and only the latest replace per
//! `(symbol, side)` group survives a cycle (earlier ones coalesce away).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::domain::{Intent, OrderDecision, OrderStatus, RiskMode, Side, Symbol};
use crate::error::Result;
use crate::rules::RulesProvider;

use super::{ExecutionEngine, SubmitContext};

const REPLACE_CURSOR_PREFIX: &str = "replace_pending:";

/// One pending replace, persisted until the old order confirms terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReplace {
    pub replace_tx_id: String,
    pub old_client_order_id: String,
    pub new_intent: Intent,
    /// `pending_cancel` until the old order is terminal
    pub state: String,
}

/// Coalesces replace requests per `(symbol, side)` group within a cycle.
#[derive(Debug, Default)]
pub struct ReplacePlanner {
    latest: HashMap<(Symbol, Side), (String, Intent)>,
}

impl ReplacePlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a replace; a later request for the same group wins.
    pub fn request(&mut self, old_client_order_id: String, new_intent: Intent) {
        let key = (new_intent.symbol.clone(), new_intent.side);
        if let Some((previous, _)) = self
            .latest
            .insert(key, (old_client_order_id, new_intent))
        {
            debug!(%previous, "earlier replace in group coalesced away");
        }
    }

    pub fn drain(self) -> Vec<(String, Intent)> {
        let mut groups: Vec<_> = self.latest.into_iter().collect();
        groups.sort_by(|a, b| a.0.cmp(&b.0));
        groups.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

impl ExecutionEngine {
    fn replace_cursor_name(symbol: &Symbol, side: Side) -> String {
        format!(
            "{}{}:{}",
            REPLACE_CURSOR_PREFIX,
            symbol.storage_key(),
            side.as_str()
        )
    }

    /// Start the coalesced replaces: cancel the old order and persist the
    /// pending pair. The submit half runs in later cycles once the old
    /// order is terminal.
    pub async fn start_replaces(
        &self,
        planner: ReplacePlanner,
        mode: RiskMode,
    ) -> Result<Vec<OrderDecision>> {
        let mut decisions = Vec::new();

        for (old_client_order_id, new_intent) in planner.drain() {
            let new_coid_seed = new_intent.hash();
            let replace_tx_id = crate::domain::ids::replace_tx_id(&old_client_order_id, &new_coid_seed);

            let Some(old_order) = self.store.get_order(&old_client_order_id).await? else {
                warn!(%old_client_order_id, "replace requested for unknown order");
                continue;
            };

            let pending = PendingReplace {
                replace_tx_id: replace_tx_id.clone(),
                old_client_order_id: old_client_order_id.clone(),
                new_intent: new_intent.clone(),
                state: "pending_cancel".to_string(),
            };
            self.store
                .set_cursor(
                    &Self::replace_cursor_name(&new_intent.symbol, new_intent.side),
                    &serde_json::to_string(&pending)?,
                )
                .await?;

            if !old_order.status.is_terminal() {
                decisions.push(self.cancel_order(&old_order, mode).await?);
            }
            info!(%replace_tx_id, %old_client_order_id, "replace started");
        }

        Ok(decisions)
    }

    /// Drive pending replaces forward: submit the replacement once the old
    /// order is terminal. An UNKNOWN order anywhere freezes all replace
    /// submits for the cycle.
    pub async fn process_pending_replaces(
        &self,
        rules: &RulesProvider,
        ctx: &SubmitContext,
    ) -> Result<Vec<OrderDecision>> {
        let mut decisions = Vec::new();

        let frozen = self
            .store
            .active_orders()
            .await?
            .iter()
            .any(|o| o.status == OrderStatus::Unknown);
        if frozen {
            warn!("unknown order present; replace submits frozen this cycle");
            return Ok(decisions);
        }

        for (symbol, side) in self.pending_replace_groups().await? {
            let name = Self::replace_cursor_name(&symbol, side);
            let Some(raw) = self.store.cursor(&name).await? else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            let pending: PendingReplace = serde_json::from_str(&raw)?;

            let Some(old_order) = self
                .store
                .get_order(&pending.old_client_order_id)
                .await?
            else {
                self.store.set_cursor(&name, "").await?;
                continue;
            };

            if !old_order.status.is_terminal() {
                debug!(
                    replace_tx_id = %pending.replace_tx_id,
                    old_status = %old_order.status,
                    "replace still pending cancel"
                );
                continue;
            }

            // Old side confirmed terminal; submit the replacement.
            let decision = self.submit_one(&pending.new_intent, rules, ctx).await?;
            info!(
                replace_tx_id = %pending.replace_tx_id,
                outcome = decision.is_accepted(),
                "replace submit executed"
            );
            self.store.set_cursor(&name, "").await?;
            decisions.push(decision);
        }

        Ok(decisions)
    }

    /// Groups with a persisted pending replace.
    async fn pending_replace_groups(&self) -> Result<Vec<(Symbol, Side)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, value FROM cursors WHERE name LIKE ?1 AND value != ''",
        )
        .bind(format!("{}%", REPLACE_CURSOR_PREFIX))
        .fetch_all(self.store.pool())
        .await?;

        let mut groups = Vec::new();
        for (name, _) in rows {
            let rest = name.trim_start_matches(REPLACE_CURSOR_PREFIX);
            let Some((symbol_key, side_raw)) = rest.rsplit_once(':') else {
                continue;
            };
            let Ok(symbol) = Symbol::from_storage_key(symbol_key) else {
                continue;
            };
            let Ok(side) = side_raw.parse::<Side>() else {
                continue;
            };
            groups.push((symbol, side));
        }
        groups.sort();
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IntentReason;
    use rust_decimal_macros::dec;

    fn intent(base: &str, side: Side, seed: &str) -> Intent {
        Intent {
            symbol: Symbol::try_base(base),
            side,
            target_price: dec!(100),
            target_qty: dec!(1),
            reason: IntentReason::Rebalance,
            strategy_id: "s1".into(),
            idempotency_seed: seed.into(),
        }
    }

    #[test]
    fn planner_coalesces_to_latest_per_group() {
        let mut planner = ReplacePlanner::new();
        planner.request("old-1".into(), intent("BTC", Side::Sell, "a"));
        planner.request("old-2".into(), intent("BTC", Side::Sell, "b"));
        planner.request("old-3".into(), intent("ETH", Side::Sell, "c"));

        assert_eq!(planner.len(), 2);
        let drained = planner.drain();
        assert_eq!(drained.len(), 2);
        let btc = drained
            .iter()
            .find(|(_, i)| i.symbol == Symbol::try_base("BTC"))
            .unwrap();
        assert_eq!(btc.0, "old-2");
        assert_eq!(btc.1.idempotency_seed, "b");
    }

    #[test]
    fn planner_distinguishes_sides() {
        let mut planner = ReplacePlanner::new();
        planner.request("old-1".into(), intent("BTC", Side::Buy, "a"));
        planner.request("old-2".into(), intent("BTC", Side::Sell, "b"));
        assert_eq!(planner.len(), 2);
    }
}
