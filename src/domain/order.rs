use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::market::{Side, Symbol};

/// Order status
///
/// ```text
/// PLANNED -> SUBMITTED -> ACKED -> OPEN
///                                   |- PARTIALLY_FILLED -> FILLED (terminal)
///                                   |- CANCELED  (terminal)
///                                   '- REJECTED  (terminal)
/// SUBMITTED timeout/ambiguous -> UNKNOWN -> {OPEN|FILLED|CANCELED|UNKNOWN_CLOSED}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Approved by risk, not yet sent
    Planned,
    /// Write call issued, no acknowledgement yet
    Submitted,
    /// Exchange acknowledged the order
    Acked,
    /// Resting on the book
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    /// Submit outcome ambiguous; being reconciled
    Unknown,
    /// Reconciliation budget exhausted without resolution
    UnknownClosed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Planned => "PLANNED",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Acked => "ACKED",
            OrderStatus::Open => "OPEN",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
            OrderStatus::UnknownClosed => "UNKNOWN_CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::UnknownClosed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitted
                | OrderStatus::Acked
                | OrderStatus::Open
                | OrderStatus::PartiallyFilled
        )
    }

    /// Legal transitions of the order state machine. Self-transitions are
    /// allowed (reconcile may re-observe the current state).
    pub fn can_transition(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        if self == to {
            return true;
        }
        match self {
            Planned => matches!(to, Submitted | Rejected),
            Submitted => matches!(to, Acked | Open | Rejected | Unknown | Filled),
            Acked => matches!(to, Open | PartiallyFilled | Filled | Canceled | Rejected),
            Open => matches!(to, PartiallyFilled | Filled | Canceled | Rejected),
            PartiallyFilled => matches!(to, Filled | Canceled),
            Unknown => matches!(to, Open | PartiallyFilled | Filled | Canceled | UnknownClosed),
            Filled | Canceled | Rejected | UnknownClosed => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PLANNED" => Ok(OrderStatus::Planned),
            "SUBMITTED" => Ok(OrderStatus::Submitted),
            "ACKED" => Ok(OrderStatus::Acked),
            "OPEN" | "NEW" => Ok(OrderStatus::Open),
            "PARTIALLY_FILLED" | "PARTIAL" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Ok(OrderStatus::Canceled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "UNKNOWN" => Ok(OrderStatus::Unknown),
            "UNKNOWN_CLOSED" => Ok(OrderStatus::UnknownClosed),
            _ => Err("invalid order status"),
        }
    }
}

/// Exchange-facing order tracked in our system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub reconcile_attempts: u32,
    pub intent_hash: String,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn planned(
        client_order_id: String,
        symbol: Symbol,
        side: Side,
        price: Decimal,
        qty: Decimal,
        intent_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            symbol,
            side,
            price,
            qty,
            status: OrderStatus::Planned,
            created_at: now,
            updated_at: now,
            reconcile_attempts: 0,
            intent_hash,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }

    /// Age of the order, used for TTL-based cancels.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn terminal_states_accept_no_transition() {
        use OrderStatus::*;
        for from in [Filled, Canceled, Rejected, UnknownClosed] {
            for to in [
                Planned,
                Submitted,
                Acked,
                Open,
                PartiallyFilled,
                Filled,
                Canceled,
                Rejected,
                Unknown,
                UnknownClosed,
            ] {
                if from == to {
                    continue;
                }
                assert!(!from.can_transition(to), "{} -> {} should be illegal", from, to);
            }
        }
    }

    #[test]
    fn filled_to_open_is_illegal() {
        assert!(!OrderStatus::Filled.can_transition(OrderStatus::Open));
    }

    #[test]
    fn unknown_resolves_to_observed_or_closed() {
        use OrderStatus::*;
        assert!(Unknown.can_transition(Open));
        assert!(Unknown.can_transition(Filled));
        assert!(Unknown.can_transition(Canceled));
        assert!(Unknown.can_transition(UnknownClosed));
        assert!(!Unknown.can_transition(Submitted));
    }

    #[test]
    fn happy_path_is_legal() {
        use OrderStatus::*;
        let path = [Planned, Submitted, Acked, Open, PartiallyFilled, Filled];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn self_transition_is_legal() {
        assert!(OrderStatus::Open.can_transition(OrderStatus::Open));
    }

    #[test]
    fn status_parses_exchange_aliases() {
        assert_eq!("NEW".parse::<OrderStatus>().unwrap(), OrderStatus::Open);
        assert_eq!(
            "CANCELLED".parse::<OrderStatus>().unwrap(),
            OrderStatus::Canceled
        );
    }

    #[test]
    fn order_age_and_notional() {
        let now = Utc::now();
        let order = Order::planned(
            "coid".into(),
            Symbol::try_base("BTC"),
            Side::Sell,
            dec!(1000000),
            dec!(0.01),
            "h".into(),
            now - chrono::Duration::seconds(90),
        );
        assert_eq!(order.notional(), dec!(10000.00));
        assert_eq!(order.age_seconds(now), 90);
    }
}
