//! Per-symbol exchange rules and price/qty quantization.
//!
//! Prices and quantities are rounded toward zero to the symbol's tick/lot;
//! min-notional is validated after quantization. Missing or invalid
//! metadata never aborts a cycle: the symbol is rejected with a stable
//! reason code and the configured policy decides whether the rest of the
//! cycle proceeds.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{InvalidMetadataPolicy, RulesConfig};
use crate::domain::Symbol;

/// Trading constraints for one symbol, normalized from exchange metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRules {
    pub symbol: Symbol,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_notional_try: Decimal,
    pub price_min: Option<Decimal>,
    pub price_max: Option<Decimal>,
    pub qty_min: Option<Decimal>,
    pub qty_max: Option<Decimal>,
}

impl SymbolRules {
    /// Internal consistency check; invalid rules are treated like missing
    /// ones by the provider.
    pub fn is_valid(&self) -> bool {
        self.tick_size > Decimal::ZERO
            && self.lot_size > Decimal::ZERO
            && self.min_notional_try >= Decimal::ZERO
    }

    /// Fallback rules for operation without exchange metadata: effectively
    /// no quantization, with the configured safe min-notional floor.
    pub fn conservative_fallback(symbol: &Symbol, cfg: &RulesConfig) -> Self {
        Self {
            symbol: symbol.clone(),
            tick_size: Decimal::new(1, 8),
            lot_size: Decimal::new(1, 8),
            min_notional_try: cfg.rules_safe_min_notional_try,
            price_min: None,
            price_max: None,
            qty_min: None,
            qty_max: None,
        }
    }
}

/// Availability of rules for a symbol at cycle time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulesStatus {
    Available(SymbolRules),
    Missing,
    Invalid(String),
}

impl RulesStatus {
    pub fn status_tag(&self) -> &'static str {
        match self {
            RulesStatus::Available(_) => "available",
            RulesStatus::Missing => "missing",
            RulesStatus::Invalid(_) => "invalid",
        }
    }
}

/// A quantized, validated order price/qty pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantized {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Stable per-intent rejection codes from the quantization stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantizeReject {
    QtyRoundsToZero,
    PriceRoundsToZero,
    MinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },
    PriceOutOfBounds,
    QtyOutOfBounds,
    RulesUnavailable(String),
}

impl QuantizeReject {
    /// Reason code persisted in the cycle trace.
    pub fn code(&self) -> String {
        match self {
            QuantizeReject::QtyRoundsToZero => "qty_rounds_to_zero".to_string(),
            QuantizeReject::PriceRoundsToZero => "price_rounds_to_zero".to_string(),
            QuantizeReject::MinNotional { .. } => "min_notional".to_string(),
            QuantizeReject::PriceOutOfBounds => "price_out_of_bounds".to_string(),
            QuantizeReject::QtyOutOfBounds => "qty_out_of_bounds".to_string(),
            QuantizeReject::RulesUnavailable(status) => {
                format!("rules_unavailable:{}", status)
            }
        }
    }
}

/// Round toward zero to a multiple of `step`.
pub fn quantize_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).trunc();
    (steps * step).normalize()
}

/// Quantize an intent's price/qty to the symbol's rules and validate the
/// result. First violation wins.
pub fn quantize_order(
    rules: &SymbolRules,
    price: Decimal,
    qty: Decimal,
) -> Result<Quantized, QuantizeReject> {
    let q_price = quantize_down(price, rules.tick_size);
    let q_qty = quantize_down(qty, rules.lot_size);

    if q_qty <= Decimal::ZERO {
        return Err(QuantizeReject::QtyRoundsToZero);
    }
    if q_price <= Decimal::ZERO {
        return Err(QuantizeReject::PriceRoundsToZero);
    }
    if let Some(min) = rules.price_min {
        if q_price < min {
            return Err(QuantizeReject::PriceOutOfBounds);
        }
    }
    if let Some(max) = rules.price_max {
        if q_price > max {
            return Err(QuantizeReject::PriceOutOfBounds);
        }
    }
    if let Some(min) = rules.qty_min {
        if q_qty < min {
            return Err(QuantizeReject::QtyOutOfBounds);
        }
    }
    if let Some(max) = rules.qty_max {
        if q_qty > max {
            return Err(QuantizeReject::QtyOutOfBounds);
        }
    }

    let notional = q_price * q_qty;
    if notional < rules.min_notional_try {
        return Err(QuantizeReject::MinNotional {
            notional,
            min_notional: rules.min_notional_try,
        });
    }

    Ok(Quantized {
        price: q_price,
        qty: q_qty,
    })
}

/// Parse one symbol's rules from exchange metadata, tolerating the field
/// aliases the exchange uses across API versions.
pub fn parse_symbol_rules(
    symbol: &Symbol,
    raw: &serde_json::Value,
    cfg: &RulesConfig,
) -> RulesStatus {
    fn decimal_field(raw: &serde_json::Value, aliases: &[&str]) -> Option<Decimal> {
        for alias in aliases {
            if let Some(v) = raw.get(alias) {
                let parsed = match v {
                    serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
                    serde_json::Value::Number(n) => n.to_string().parse::<Decimal>().ok(),
                    _ => None,
                };
                if parsed.is_some() {
                    return parsed;
                }
            }
        }
        None
    }

    let tick_size = decimal_field(raw, &["tick_size", "tickSize", "price_increment"]);
    let lot_size = decimal_field(raw, &["lot_size", "stepSize", "qty_increment", "lotSize"]);
    let min_notional = decimal_field(raw, &["min_notional_try", "minNotional", "min_total"]);

    let (tick_size, lot_size) = match (tick_size, lot_size) {
        (Some(t), Some(l)) => (t, l),
        (None, None) => return RulesStatus::Missing,
        _ => return RulesStatus::Invalid("tick/lot metadata incomplete".to_string()),
    };

    let rules = SymbolRules {
        symbol: symbol.clone(),
        tick_size,
        lot_size,
        min_notional_try: min_notional.unwrap_or(cfg.rules_safe_min_notional_try),
        price_min: decimal_field(raw, &["price_min", "minPrice"]),
        price_max: decimal_field(raw, &["price_max", "maxPrice"]),
        qty_min: decimal_field(raw, &["qty_min", "minQty"]),
        qty_max: decimal_field(raw, &["qty_max", "maxQty"]),
    };

    if rules.is_valid() {
        RulesStatus::Available(rules)
    } else {
        RulesStatus::Invalid(format!(
            "non-positive tick ({}) or lot ({})",
            rules.tick_size, rules.lot_size
        ))
    }
}

/// Per-cycle rules lookup built from exchange metadata once per cycle.
#[derive(Debug, Clone, Default)]
pub struct RulesProvider {
    by_symbol: HashMap<Symbol, RulesStatus>,
    policy: InvalidMetadataPolicy,
}

impl RulesProvider {
    pub fn new(policy: InvalidMetadataPolicy) -> Self {
        Self {
            by_symbol: HashMap::new(),
            policy,
        }
    }

    pub fn from_metadata(
        universe: &[Symbol],
        metadata: &HashMap<Symbol, serde_json::Value>,
        cfg: &RulesConfig,
    ) -> Self {
        let mut provider = Self::new(cfg.rules_invalid_metadata_policy);
        for symbol in universe {
            let status = match metadata.get(symbol) {
                Some(raw) => parse_symbol_rules(symbol, raw, cfg),
                None => RulesStatus::Missing,
            };
            // Without the metadata requirement a symbol still trades, under
            // a conservative fallback rules set.
            let status = match status {
                RulesStatus::Available(_) => status,
                _ if !cfg.rules_require_metadata => {
                    RulesStatus::Available(SymbolRules::conservative_fallback(symbol, cfg))
                }
                other => other,
            };
            provider.by_symbol.insert(symbol.clone(), status);
        }
        provider
    }

    pub fn insert(&mut self, symbol: Symbol, status: RulesStatus) {
        self.by_symbol.insert(symbol, status);
    }

    pub fn status(&self, symbol: &Symbol) -> &RulesStatus {
        static MISSING: RulesStatus = RulesStatus::Missing;
        self.by_symbol.get(symbol).unwrap_or(&MISSING)
    }

    pub fn get(&self, symbol: &Symbol) -> Result<&SymbolRules, QuantizeReject> {
        match self.status(symbol) {
            RulesStatus::Available(rules) => Ok(rules),
            status => Err(QuantizeReject::RulesUnavailable(
                status.status_tag().to_string(),
            )),
        }
    }

    /// Whether any symbol with unavailable rules should force the whole
    /// cycle to observe-only under the configured policy.
    pub fn forces_observe_only(&self) -> bool {
        self.policy == InvalidMetadataPolicy::ObserveOnlyCycle
            && self
                .by_symbol
                .values()
                .any(|s| !matches!(s, RulesStatus::Available(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_rules() -> SymbolRules {
        SymbolRules {
            symbol: Symbol::try_base("BTC"),
            tick_size: dec!(0.01),
            lot_size: dec!(0.00001),
            min_notional_try: dec!(100),
            price_min: None,
            price_max: None,
            qty_min: None,
            qty_max: None,
        }
    }

    #[test]
    fn quantize_rounds_toward_zero() {
        assert_eq!(quantize_down(dec!(1010000.018), dec!(0.01)), dec!(1010000.01));
        assert_eq!(quantize_down(dec!(0.0025049), dec!(0.00001)), dec!(0.0025));
        assert_eq!(quantize_down(dec!(7), dec!(2)), dec!(6));
    }

    #[test]
    fn quantized_values_are_multiples_and_never_larger() {
        let cases = [
            (dec!(1010000.37), dec!(0.01)),
            (dec!(0.123456789), dec!(0.00001)),
            (dec!(999.999), dec!(0.5)),
        ];
        for (value, step) in cases {
            let q = quantize_down(value, step);
            assert!(q <= value, "{} > {}", q, value);
            assert_eq!((q / step).fract(), Decimal::ZERO, "{} not multiple of {}", q, step);
        }
    }

    #[test]
    fn min_notional_checked_after_quantization() {
        let rules = btc_rules();
        // 0.0001 BTC * 999,999 = 99.9999 < 100 once quantized
        let err = quantize_order(&rules, dec!(999999.999), dec!(0.0001)).unwrap_err();
        assert_eq!(err.code(), "min_notional");
    }

    #[test]
    fn tiny_qty_rounds_to_zero() {
        let rules = btc_rules();
        let err = quantize_order(&rules, dec!(1000000), dec!(0.000001)).unwrap_err();
        assert_eq!(err.code(), "qty_rounds_to_zero");
    }

    #[test]
    fn take_profit_scenario_quantizes_exactly() {
        let rules = btc_rules();
        let q = quantize_order(&rules, dec!(1010000), dec!(0.0025)).unwrap();
        assert_eq!(q.price, dec!(1010000));
        assert_eq!(q.qty, dec!(0.0025));
    }

    #[test]
    fn bounds_are_enforced() {
        let mut rules = btc_rules();
        rules.qty_max = Some(dec!(0.001));
        let err = quantize_order(&rules, dec!(1000000), dec!(0.01)).unwrap_err();
        assert_eq!(err.code(), "qty_out_of_bounds");
    }

    #[test]
    fn metadata_aliases_normalize() {
        let cfg = RulesConfig::default();
        let symbol = Symbol::try_base("BTC");
        let raw = serde_json::json!({
            "tickSize": "0.01",
            "stepSize": "0.00001",
            "minNotional": 100,
        });
        match parse_symbol_rules(&symbol, &raw, &cfg) {
            RulesStatus::Available(rules) => {
                assert_eq!(rules.tick_size, dec!(0.01));
                assert_eq!(rules.lot_size, dec!(0.00001));
                assert_eq!(rules.min_notional_try, dec!(100));
            }
            other => panic!("expected available rules, got {:?}", other),
        }
    }

    #[test]
    fn missing_metadata_yields_missing_status() {
        let cfg = RulesConfig::default();
        let symbol = Symbol::try_base("BTC");
        let raw = serde_json::json!({ "unrelated": true });
        assert_eq!(parse_symbol_rules(&symbol, &raw, &cfg), RulesStatus::Missing);
    }

    #[test]
    fn zero_tick_is_invalid() {
        let cfg = RulesConfig::default();
        let symbol = Symbol::try_base("BTC");
        let raw = serde_json::json!({ "tick_size": "0", "lot_size": "0.001" });
        assert!(matches!(
            parse_symbol_rules(&symbol, &raw, &cfg),
            RulesStatus::Invalid(_)
        ));
    }

    #[test]
    fn provider_policy_forces_observe_only() {
        let mut provider = RulesProvider::new(InvalidMetadataPolicy::ObserveOnlyCycle);
        provider.insert(Symbol::try_base("BTC"), RulesStatus::Available(btc_rules()));
        assert!(!provider.forces_observe_only());

        provider.insert(Symbol::try_base("ETH"), RulesStatus::Missing);
        assert!(provider.forces_observe_only());

        let mut skip = RulesProvider::new(InvalidMetadataPolicy::SkipSymbol);
        skip.insert(Symbol::try_base("ETH"), RulesStatus::Missing);
        assert!(!skip.forces_observe_only());
    }

    #[test]
    fn unavailable_rules_carry_status_in_code() {
        let provider = RulesProvider::new(InvalidMetadataPolicy::SkipSymbol);
        let err = provider.get(&Symbol::try_base("DOGE")).unwrap_err();
        assert_eq!(err.code(), "rules_unavailable:missing");
    }

    #[test]
    fn optional_metadata_falls_back_to_conservative_rules() {
        let cfg = RulesConfig {
            rules_require_metadata: false,
            ..RulesConfig::default()
        };
        let universe = vec![Symbol::try_base("BTC")];
        let provider = RulesProvider::from_metadata(&universe, &HashMap::new(), &cfg);
        let rules = provider.get(&Symbol::try_base("BTC")).unwrap();
        assert_eq!(rules.min_notional_try, cfg.rules_safe_min_notional_try);
        assert_eq!(rules.tick_size, dec!(0.00000001));
    }

    #[test]
    fn partial_tick_lot_metadata_is_invalid_not_missing() {
        let cfg = RulesConfig::default();
        let symbol = Symbol::try_base("BTC");
        let raw = serde_json::json!({ "tickSize": "0.01" });
        assert!(matches!(
            parse_symbol_rules(&symbol, &raw, &cfg),
            RulesStatus::Invalid(_)
        ));
    }
}
