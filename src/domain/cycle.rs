use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::intent::Intent;
use super::ledger::LedgerMetrics;
use super::market::{Side, Symbol};
use super::order::OrderStatus;
use super::risk::RiskDecision;

/// What happened to one intent inside the execution stage. Sum-typed so the
/// cycle trace records expected outcomes without exceptions-as-control-flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OrderDecision {
    /// Order submitted (or simulated under dry-run)
    Accepted {
        client_order_id: String,
        symbol: Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
        status: OrderStatus,
        simulated: bool,
    },
    /// Rejected before any exchange call; carries the stable reason code
    Rejected {
        symbol: Symbol,
        side: Side,
        reason_code: String,
    },
    /// Write outcome ambiguous; order entered the reconcile path
    NeedsReconcile {
        client_order_id: String,
        symbol: Symbol,
        side: Side,
    },
    /// Duplicate action inside the dedupe window; cached decision returned
    Deduplicated { client_order_id: String },
    /// Routed into the replace path: the old order is being canceled and
    /// the submit waits for it to confirm terminal
    ReplacePending {
        old_client_order_id: String,
        symbol: Symbol,
        side: Side,
    },
    /// Symbol skipped wholesale (e.g. rules unavailable)
    Skipped {
        symbol: Symbol,
        reason_code: String,
    },
}

impl OrderDecision {
    pub fn reason_code(&self) -> Option<&str> {
        match self {
            OrderDecision::Rejected { reason_code, .. }
            | OrderDecision::Skipped { reason_code, .. } => Some(reason_code),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, OrderDecision::Accepted { .. })
    }
}

/// Atomic per-cycle record. Persisted in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub ts: DateTime<Utc>,
    pub selected_universe: Vec<Symbol>,
    pub risk_decision: RiskDecision,
    pub intents: Vec<Intent>,
    pub order_decisions: Vec<OrderDecision>,
    pub ledger_metrics: LedgerMetrics,
    pub active_param_version: i64,
}

/// Result handed back to the scheduler after one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: String,
    pub mode: super::risk::RiskMode,
    pub intents_proposed: usize,
    pub orders_submitted: usize,
    pub orders_canceled: usize,
    pub rejects: usize,
    pub duration_ms: u64,
}
