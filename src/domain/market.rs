use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{LirabotError, Result};

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Side {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            _ => Err("invalid side; expected BUY|SELL"),
        }
    }
}

pub fn parse_side(raw: &str) -> Result<Side> {
    Side::from_str(raw).map_err(|e| LirabotError::Validation(e.to_string()))
}

/// Canonical trading pair: uppercase base + quote (quote is always TRY for
/// this agent, but the type does not assume it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol {
    pub base: String,
    pub quote: String,
}

impl Symbol {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().trim().to_ascii_uppercase(),
            quote: quote.into().trim().to_ascii_uppercase(),
        }
    }

    pub fn try_base(base: impl Into<String>) -> Self {
        Self::new(base, "TRY")
    }

    /// Exchange wire form, e.g. "BTCTRY".
    pub fn pair(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Unambiguous persisted form, e.g. "BTC/TRY".
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    pub fn from_storage_key(raw: &str) -> Result<Self> {
        let (base, quote) = raw.split_once('/').ok_or_else(|| {
            LirabotError::Validation(format!("stored symbol '{}' missing '/'", raw))
        })?;
        if base.is_empty() || quote.is_empty() {
            return Err(LirabotError::Validation(format!(
                "stored symbol '{}' has empty base or quote",
                raw
            )));
        }
        Ok(Self::new(base, quote))
    }

    /// Parse "BTC_TRY" / "BTCTRY" / "btc-try" style pair strings against a
    /// known quote currency.
    pub fn parse_pair(raw: &str, quote: &str) -> Result<Self> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let quote = quote.trim().to_ascii_uppercase();
        let base = cleaned
            .strip_suffix(quote.as_str())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| {
                LirabotError::Validation(format!("symbol '{}' does not end in {}", raw, quote))
            })?;
        Ok(Self::new(base, quote))
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Top-of-book snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopOfBook {
    pub symbol: Symbol,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub ts: DateTime<Utc>,
}

impl TopOfBook {
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::from(2)
    }

    pub fn spread_bps(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / mid * Decimal::from(10_000)
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.ts).num_milliseconds()
    }
}

/// Free/locked balance for one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_canonicalizes_to_uppercase() {
        let s = Symbol::new(" btc ", "try");
        assert_eq!(s.base, "BTC");
        assert_eq!(s.quote, "TRY");
        assert_eq!(s.pair(), "BTCTRY");
    }

    #[test]
    fn parse_pair_strips_separators() {
        for raw in ["BTCTRY", "BTC_TRY", "btc-try", " BtcTry "] {
            let s = Symbol::parse_pair(raw, "TRY").expect(raw);
            assert_eq!(s, Symbol::try_base("BTC"));
        }
    }

    #[test]
    fn parse_pair_rejects_wrong_quote() {
        assert!(Symbol::parse_pair("BTCUSDT", "TRY").is_err());
        assert!(Symbol::parse_pair("TRY", "TRY").is_err());
    }

    #[test]
    fn spread_bps_from_top_of_book() {
        let top = TopOfBook {
            symbol: Symbol::try_base("BTC"),
            best_bid: dec!(1000000),
            best_ask: dec!(1001000),
            ts: Utc::now(),
        };
        // spread 1000 over mid 1000500 ~= 9.995 bps
        let bps = top.spread_bps();
        assert!(bps > dec!(9.9) && bps < dec!(10.1), "got {}", bps);
    }

    #[test]
    fn side_round_trips_through_str() {
        assert_eq!(parse_side("buy").unwrap(), Side::Buy);
        assert_eq!(parse_side(" SELL ").unwrap(), Side::Sell);
        assert!(parse_side("HOLD").is_err());
    }
}
