use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Self-financing capital buckets. Single durable row.
///
/// `last_event_count` is monotonically non-decreasing; a checkpoint at the
/// same count is a no-op, a lower count is an integrity failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapitalState {
    pub trading_capital_try: Decimal,
    pub treasury_try: Decimal,
    pub last_realized_pnl_total_try: Decimal,
    pub last_event_count: i64,
    pub updated_at: DateTime<Utc>,
}

impl CapitalState {
    pub fn bootstrap(initial_trading_capital_try: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            trading_capital_try: initial_trading_capital_try,
            treasury_try: Decimal::ZERO,
            last_realized_pnl_total_try: Decimal::ZERO,
            last_event_count: 0,
            updated_at: now,
        }
    }
}

/// Append-only record of one capital checkpoint application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalChange {
    pub ts: DateTime<Utc>,
    pub realized_delta_try: Decimal,
    pub trading_delta_try: Decimal,
    pub treasury_delta_try: Decimal,
    pub event_count: i64,
}
