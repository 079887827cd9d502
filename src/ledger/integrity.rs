//! Ledger integrity checker.
//!
//! Recomputes accounting state from the event stream and cross-checks the
//! persisted `positions` snapshot, surfacing drift, unapplied fills, and
//! unconverted foreign fees.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{info, warn};

use crate::domain::Symbol;
use crate::error::Result;
use crate::persistence::StateStore;

use super::reduce::reduce_all;

/// Result of a single integrity check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub count: i64,
    pub detail: Option<String>,
}

/// Full integrity report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub healthy: bool,
    pub checks: Vec<CheckResult>,
}

impl std::fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy { "HEALTHY" } else { "UNHEALTHY" };
        writeln!(f, "=== Ledger Integrity Report: {} ===", status)?;
        for check in &self.checks {
            let icon = if check.ok { "OK" } else { "FAIL" };
            write!(f, "  [{:>4}] {} (count: {})", icon, check.name, check.count)?;
            if let Some(ref detail) = check.detail {
                write!(f, " - {}", detail)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub struct IntegrityChecker {
    store: StateStore,
    quote_currency: String,
}

impl IntegrityChecker {
    pub fn new(store: StateStore, quote_currency: impl Into<String>) -> Self {
        Self {
            store,
            quote_currency: quote_currency.into(),
        }
    }

    /// Run the full check suite.
    pub async fn run_full_check(&self) -> Result<IntegrityReport> {
        let mut checks = Vec::new();

        checks.push(self.check_position_drift().await?);
        checks.push(self.check_unapplied_fills().await?);
        checks.push(self.check_foreign_fees().await?);
        checks.push(self.check_illegal_transition_counter().await?);

        let healthy = checks.iter().all(|c| c.ok);
        let report = IntegrityReport { healthy, checks };

        if report.healthy {
            info!("integrity check passed: all checks OK");
        } else {
            warn!("integrity check found issues");
        }
        Ok(report)
    }

    /// Recompute positions from events and compare the persisted snapshot.
    async fn check_position_drift(&self) -> Result<CheckResult> {
        let events = self.store.all_events().await?;
        let state = reduce_all(events.iter(), &self.quote_currency)?;

        let mut drifted: Vec<Symbol> = Vec::new();
        let tolerance = Decimal::new(1, 6); // 0.000001
        for (symbol, stored) in self.store.positions().await? {
            let computed_qty = state.qty(&symbol);
            let computed_avg = state.avg_cost(&symbol);
            if (stored.qty - computed_qty).abs() > tolerance
                || (stored.avg_cost - computed_avg).abs() > tolerance
            {
                drifted.push(symbol);
            }
        }

        let count = drifted.len() as i64;
        let detail = (count > 0).then(|| {
            let names: Vec<String> = drifted.iter().take(5).map(|s| s.pair()).collect();
            format!("drifted symbols (first 5): {}", names.join(", "))
        });

        Ok(CheckResult {
            name: "position_drift".into(),
            ok: count == 0,
            count,
            detail,
        })
    }

    /// Fills recorded but never applied to the ledger.
    async fn check_unapplied_fills(&self) -> Result<CheckResult> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM fills f
            WHERE NOT EXISTS (SELECT 1 FROM applied_fills a WHERE a.fill_id = f.fill_id)
            "#,
        )
        .fetch_one(self.store.pool())
        .await?;
        let count: i64 = row.get("n");
        Ok(CheckResult {
            name: "unapplied_fills".into(),
            ok: count == 0,
            count,
            detail: None,
        })
    }

    /// Fees awaiting a conversion rate. Informational only: the check is
    /// reported ok but lists the currencies.
    async fn check_foreign_fees(&self) -> Result<CheckResult> {
        let rows = sqlx::query(
            r#"
            SELECT fee_currency, COUNT(*) AS n FROM ledger_events
            WHERE type = 'FEE' AND meta LIKE 'fee_conversion_missing:%'
            GROUP BY fee_currency
            "#,
        )
        .fetch_all(self.store.pool())
        .await?;

        let count: i64 = rows.iter().map(|r| r.get::<i64, _>("n")).sum();
        let detail = (!rows.is_empty()).then(|| {
            let currencies: Vec<String> = rows
                .iter()
                .map(|r| r.get::<Option<String>, _>("fee_currency").unwrap_or_default())
                .collect();
            format!("unconverted fee currencies: {}", currencies.join(", "))
        });

        Ok(CheckResult {
            name: "fee_conversion_missing".into(),
            ok: true,
            count,
            detail,
        })
    }

    /// Illegal transitions observed since the database was created.
    async fn check_illegal_transition_counter(&self) -> Result<CheckResult> {
        let count = self
            .store
            .meta("illegal_transitions")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(CheckResult {
            name: "illegal_transitions".into(),
            ok: count == 0,
            count,
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Fill, Side};
    use crate::ledger::AccountingLedger;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn fill(id: &str, side: Side, qty: Decimal, price: Decimal) -> Fill {
        Fill {
            fill_id: id.to_string(),
            order_id: None,
            client_order_id: None,
            symbol: Symbol::try_base("BTC"),
            side,
            price,
            qty,
            fee_amount: Decimal::ZERO,
            fee_currency: "TRY".into(),
            traded_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn healthy_after_clean_ingest() {
        let store = StateStore::open(":memory:").await.unwrap();
        let mut ledger = AccountingLedger::load(store.clone(), "TRY").await.unwrap();
        ledger
            .ingest_fills(
                &[fill("t1", Side::Buy, dec!(1), dec!(100))],
                &HashMap::new(),
                None,
            )
            .await
            .unwrap();

        let report = IntegrityChecker::new(store, "TRY")
            .run_full_check()
            .await
            .unwrap();
        assert!(report.healthy, "{}", report);
    }

    #[tokio::test]
    async fn unapplied_fill_is_flagged() {
        let store = StateStore::open(":memory:").await.unwrap();
        store
            .record_fill(&fill("stray", Side::Buy, dec!(1), dec!(100)))
            .await
            .unwrap();

        let report = IntegrityChecker::new(store, "TRY")
            .run_full_check()
            .await
            .unwrap();
        assert!(!report.healthy);
        let check = report
            .checks
            .iter()
            .find(|c| c.name == "unapplied_fills")
            .unwrap();
        assert_eq!(check.count, 1);
    }

    #[tokio::test]
    async fn report_renders_human_readable() {
        let report = IntegrityReport {
            healthy: false,
            checks: vec![CheckResult {
                name: "position_drift".into(),
                ok: false,
                count: 2,
                detail: Some("drifted symbols (first 5): BTCTRY".into()),
            }],
        };
        let text = report.to_string();
        assert!(text.contains("UNHEALTHY"));
        assert!(text.contains("position_drift"));
        assert!(text.contains("BTCTRY"));
    }
}
