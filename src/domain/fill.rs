use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids;
use super::market::{Side, Symbol};

/// An exchange-reported trade. `fill_id` is the uniqueness key; re-ingesting
/// the same fill is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee_amount: Decimal,
    pub fee_currency: String,
    pub traded_at: DateTime<Utc>,
}

impl Fill {
    /// Normalize a fill reported without an exchange trade id by minting the
    /// deterministic fallback id.
    pub fn with_fallback_id(mut self) -> Self {
        if self.fill_id.trim().is_empty() {
            self.fill_id = ids::fill_id_fallback(
                self.client_order_id.as_deref().unwrap_or(""),
                self.traded_at.timestamp_millis(),
                self.side,
                self.qty,
                self.price,
            );
        }
        self
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }

    pub fn has_fee(&self) -> bool {
        !self.fee_amount.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(id: &str) -> Fill {
        use chrono::TimeZone;
        Fill {
            fill_id: id.to_string(),
            order_id: Some("ex-1".into()),
            client_order_id: Some("coid-1".into()),
            symbol: Symbol::try_base("BTC"),
            side: Side::Buy,
            price: dec!(1000000),
            qty: dec!(0.01),
            fee_amount: dec!(10),
            fee_currency: "TRY".into(),
            traded_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fallback_id_minted_only_when_missing() {
        let kept = fill("trade-9").with_fallback_id();
        assert_eq!(kept.fill_id, "trade-9");

        let minted = fill("").with_fallback_id();
        assert!(minted.fill_id.starts_with("synthetic:"));

        let again = fill("").with_fallback_id();
        assert_eq!(minted.fill_id, again.fill_id, "fallback must be deterministic");
    }

    #[test]
    fn notional_and_fee_flags() {
        let f = fill("t");
        assert_eq!(f.notional(), dec!(10000.00));
        assert!(f.has_fee());

        let mut free = fill("t2");
        free.fee_amount = Decimal::ZERO;
        assert!(!free.has_fee());
    }
}
