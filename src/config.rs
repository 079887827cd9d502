use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

use crate::error::{LirabotError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub safety: SafetyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Agent-level settings: cadence and universe.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Account key scoping the single-writer lock and cursors
    pub account_key: String,
    /// Quote currency; the agent trades spot pairs quoted in this
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,
    /// Base assets to trade, e.g. ["BTC", "ETH"]
    pub universe: Vec<String>,
    /// Cycle cadence in seconds (1-60)
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,
    /// Role tag mixed into cycle ids
    #[serde(default = "default_process_role")]
    pub process_role: String,
    /// Strategy identifier for the reference strategy
    #[serde(default = "default_strategy_id")]
    pub strategy_id: String,
}

fn default_quote_currency() -> String {
    "TRY".to_string()
}

fn default_cycle_interval_secs() -> u64 {
    15
}

fn default_process_role() -> String {
    "agent".to_string()
}

fn default_strategy_id() -> String {
    "take_profit_v1".to_string()
}

impl AgentConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.account_key.trim().is_empty() {
            errors.push("agent.account_key must not be empty".to_string());
        }
        if self.universe.is_empty() {
            errors.push("agent.universe must list at least one base asset".to_string());
        }
        if !(1..=60).contains(&self.cycle_interval_secs) {
            errors.push(format!(
                "agent.cycle_interval_secs must be in 1..=60, got {}",
                self.cycle_interval_secs
            ));
        }
        errors
    }
}

/// Safety gates. Live writes require kill_switch=false, dry_run=false,
/// live_trading=true and the exact acknowledgement literal, plus
/// safe_mode=false.
#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub kill_switch: bool,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default)]
    pub live_trading: bool,
    #[serde(default)]
    pub live_trading_ack: String,
    #[serde(default)]
    pub safe_mode: bool,
    /// Master enable for the cycle pipeline
    #[serde(default = "default_true")]
    pub stage_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            kill_switch: true,
            dry_run: true,
            live_trading: false,
            live_trading_ack: String::new(),
            safe_mode: false,
            stage_enabled: true,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        // Arming without the acknowledgement literal is a config mistake,
        // not a runtime downgrade.
        if self.live_trading
            && !self.live_trading_ack.is_empty()
            && self.live_trading_ack != crate::safety::LIVE_ACK_LITERAL
        {
            errors.push(format!(
                "safety.live_trading_ack must be exactly \"{}\" to arm live trading",
                crate::safety::LIVE_ACK_LITERAL
            ));
        }
        if self.live_trading && self.dry_run && !self.live_trading_ack.is_empty() {
            errors.push(
                "safety.live_trading=true with dry_run=true is contradictory; disable one"
                    .to_string(),
            );
        }
        errors
    }
}

/// Risk limits and pre-trade filter parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_orders_per_cycle")]
    pub max_orders_per_cycle: usize,
    #[serde(default = "default_max_open_orders_per_symbol")]
    pub max_open_orders_per_symbol: usize,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: i64,
    #[serde(default = "default_max_notional_per_order_try")]
    pub max_notional_per_order_try: Decimal,
    #[serde(default = "default_notional_cap_per_cycle_try")]
    pub notional_cap_per_cycle_try: Decimal,
    #[serde(default = "default_min_order_notional_try")]
    pub min_order_notional_try: Decimal,
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: Decimal,
    #[serde(default = "default_fee_bps_taker")]
    pub fee_bps_taker: Decimal,
    #[serde(default = "default_slippage_bps_buffer")]
    pub slippage_bps_buffer: Decimal,
    #[serde(default = "default_max_daily_loss_try")]
    pub max_daily_loss_try: Decimal,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: Decimal,
    #[serde(default = "default_max_gross_exposure_try")]
    pub max_gross_exposure_try: Decimal,
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "default_max_fee_per_day_try")]
    pub max_fee_per_day_try: Decimal,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    /// Upgrade the loss-streak response from REDUCE_RISK_ONLY to OBSERVE_ONLY
    #[serde(default)]
    pub escalate_loss_streak_to_observe: bool,
    /// Cooldown applied when the drawdown/daily-loss breaker trips
    #[serde(default = "default_breaker_cooldown_seconds")]
    pub breaker_cooldown_seconds: i64,
    /// Spread above this is treated as a market-data anomaly
    #[serde(default = "default_spread_spike_bps")]
    pub spread_spike_bps: Decimal,
}

fn default_max_orders_per_cycle() -> usize {
    4
}
fn default_max_open_orders_per_symbol() -> usize {
    2
}
fn default_cooldown_seconds() -> i64 {
    120
}
fn default_max_notional_per_order_try() -> Decimal {
    Decimal::new(5_000, 0)
}
fn default_notional_cap_per_cycle_try() -> Decimal {
    Decimal::new(10_000, 0)
}
fn default_min_order_notional_try() -> Decimal {
    Decimal::new(100, 0)
}
fn default_min_profit_bps() -> Decimal {
    Decimal::new(50, 0)
}
fn default_fee_bps_taker() -> Decimal {
    Decimal::new(18, 0)
}
fn default_slippage_bps_buffer() -> Decimal {
    Decimal::new(10, 0)
}
fn default_max_daily_loss_try() -> Decimal {
    Decimal::new(2_000, 0)
}
fn default_max_drawdown() -> Decimal {
    Decimal::new(15, 2) // 0.15
}
fn default_max_gross_exposure_try() -> Decimal {
    Decimal::new(50_000, 0)
}
fn default_max_position_pct() -> Decimal {
    Decimal::new(40, 2) // 0.40
}
fn default_max_fee_per_day_try() -> Decimal {
    Decimal::new(200, 0)
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_breaker_cooldown_seconds() -> i64 {
    1_800
}
fn default_spread_spike_bps() -> Decimal {
    Decimal::new(150, 0)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_orders_per_cycle: default_max_orders_per_cycle(),
            max_open_orders_per_symbol: default_max_open_orders_per_symbol(),
            cooldown_seconds: default_cooldown_seconds(),
            max_notional_per_order_try: default_max_notional_per_order_try(),
            notional_cap_per_cycle_try: default_notional_cap_per_cycle_try(),
            min_order_notional_try: default_min_order_notional_try(),
            min_profit_bps: default_min_profit_bps(),
            fee_bps_taker: default_fee_bps_taker(),
            slippage_bps_buffer: default_slippage_bps_buffer(),
            max_daily_loss_try: default_max_daily_loss_try(),
            max_drawdown: default_max_drawdown(),
            max_gross_exposure_try: default_max_gross_exposure_try(),
            max_position_pct: default_max_position_pct(),
            max_fee_per_day_try: default_max_fee_per_day_try(),
            max_consecutive_losses: default_max_consecutive_losses(),
            escalate_loss_streak_to_observe: false,
            breaker_cooldown_seconds: default_breaker_cooldown_seconds(),
            spread_spike_bps: default_spread_spike_bps(),
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_orders_per_cycle == 0 {
            errors.push("risk.max_orders_per_cycle must be > 0".to_string());
        }
        if self.max_drawdown <= Decimal::ZERO || self.max_drawdown >= Decimal::ONE {
            errors.push(format!(
                "risk.max_drawdown must be in (0, 1), got {}",
                self.max_drawdown
            ));
        }
        if self.max_position_pct <= Decimal::ZERO || self.max_position_pct > Decimal::ONE {
            errors.push(format!(
                "risk.max_position_pct must be in (0, 1], got {}",
                self.max_position_pct
            ));
        }
        if self.min_order_notional_try <= Decimal::ZERO {
            errors.push("risk.min_order_notional_try must be > 0".to_string());
        }
        if self.max_notional_per_order_try < self.min_order_notional_try {
            errors.push(
                "risk.max_notional_per_order_try must be >= risk.min_order_notional_try"
                    .to_string(),
            );
        }
        errors
    }
}

/// Self-financing profit split.
#[derive(Debug, Clone, Deserialize)]
pub struct CapitalConfig {
    #[serde(default = "default_profit_compound_ratio")]
    pub profit_compound_ratio: Decimal,
    #[serde(default = "default_profit_treasury_ratio")]
    pub profit_treasury_ratio: Decimal,
    #[serde(default = "default_cash_reserve_target_try")]
    pub cash_reserve_target_try: Decimal,
    #[serde(default = "default_initial_trading_capital_try")]
    pub initial_trading_capital_try: Decimal,
}

fn default_profit_compound_ratio() -> Decimal {
    Decimal::new(60, 2) // 0.60
}
fn default_profit_treasury_ratio() -> Decimal {
    Decimal::new(40, 2) // 0.40
}
fn default_cash_reserve_target_try() -> Decimal {
    Decimal::new(1_000, 0)
}
fn default_initial_trading_capital_try() -> Decimal {
    Decimal::new(10_000, 0)
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            profit_compound_ratio: default_profit_compound_ratio(),
            profit_treasury_ratio: default_profit_treasury_ratio(),
            cash_reserve_target_try: default_cash_reserve_target_try(),
            initial_trading_capital_try: default_initial_trading_capital_try(),
        }
    }
}

impl CapitalConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.profit_compound_ratio < Decimal::ZERO || self.profit_treasury_ratio < Decimal::ZERO
        {
            errors.push("capital ratios must be >= 0".to_string());
        }
        if self.profit_compound_ratio + self.profit_treasury_ratio != Decimal::ONE {
            errors.push(format!(
                "capital.profit_compound_ratio + profit_treasury_ratio must equal 1, got {} + {}",
                self.profit_compound_ratio, self.profit_treasury_ratio
            ));
        }
        errors
    }
}

/// Execution engine tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Stale-order cancel threshold; also the action dedupe bucket width
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: i64,
    #[serde(default = "default_max_reconcile_attempts")]
    pub max_reconcile_attempts: u32,
    /// Wall-clock ceiling for the unknown-order probe loop
    #[serde(default = "default_reconcile_ceiling_seconds")]
    pub reconcile_ceiling_seconds: i64,
    #[serde(default = "default_unknown_order_escalation_threshold")]
    pub unknown_order_escalation_threshold: i64,
    /// Free-balance safety buffer applied to the submit pre-check
    #[serde(default = "default_balance_buffer_ratio")]
    pub balance_buffer_ratio: Decimal,
}

fn default_ttl_seconds() -> i64 {
    60
}
fn default_max_reconcile_attempts() -> u32 {
    5
}
fn default_reconcile_ceiling_seconds() -> i64 {
    600
}
fn default_unknown_order_escalation_threshold() -> i64 {
    3
}
fn default_balance_buffer_ratio() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            max_reconcile_attempts: default_max_reconcile_attempts(),
            reconcile_ceiling_seconds: default_reconcile_ceiling_seconds(),
            unknown_order_escalation_threshold: default_unknown_order_escalation_threshold(),
            balance_buffer_ratio: default_balance_buffer_ratio(),
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.ttl_seconds <= 0 {
            errors.push("execution.ttl_seconds must be > 0".to_string());
        }
        if self.max_reconcile_attempts == 0 {
            errors.push("execution.max_reconcile_attempts must be > 0".to_string());
        }
        if self.unknown_order_escalation_threshold <= 0 {
            errors.push("execution.unknown_order_escalation_threshold must be > 0".to_string());
        }
        errors
    }
}

/// Transport budgets consumed by the retry/rate-limit helpers.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_rest_max_retries")]
    pub rest_max_retries: u32,
    #[serde(default = "default_rest_base_delay_ms")]
    pub rest_base_delay_ms: u64,
    #[serde(default = "default_rest_max_delay_ms")]
    pub rest_max_delay_ms: u64,
    #[serde(default = "default_market_data_max_age_ms")]
    pub market_data_max_age_ms: i64,
}

fn default_rate_limit_rps() -> u32 {
    5
}
fn default_rate_limit_burst() -> u32 {
    10
}
fn default_rest_max_retries() -> u32 {
    3
}
fn default_rest_base_delay_ms() -> u64 {
    250
}
fn default_rest_max_delay_ms() -> u64 {
    5_000
}
fn default_market_data_max_age_ms() -> i64 {
    10_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            rest_max_retries: default_rest_max_retries(),
            rest_base_delay_ms: default_rest_base_delay_ms(),
            rest_max_delay_ms: default_rest_max_delay_ms(),
            market_data_max_age_ms: default_market_data_max_age_ms(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.rate_limit_rps == 0 {
            errors.push("transport.rate_limit_rps must be > 0".to_string());
        }
        if self.rest_max_delay_ms < self.rest_base_delay_ms {
            errors.push("transport.rest_max_delay_ms must be >= rest_base_delay_ms".to_string());
        }
        errors
    }
}

/// Exchange-rules metadata policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_true")]
    pub rules_require_metadata: bool,
    #[serde(default)]
    pub rules_invalid_metadata_policy: InvalidMetadataPolicy,
    /// Conservative min-notional used when metadata omits one
    #[serde(default = "default_rules_safe_min_notional_try")]
    pub rules_safe_min_notional_try: Decimal,
}

fn default_rules_safe_min_notional_try() -> Decimal {
    Decimal::new(100, 0)
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            rules_require_metadata: true,
            rules_invalid_metadata_policy: InvalidMetadataPolicy::default(),
            rules_safe_min_notional_try: default_rules_safe_min_notional_try(),
        }
    }
}

/// What to do with a cycle when a symbol's rules are missing or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidMetadataPolicy {
    #[default]
    SkipSymbol,
    ObserveOnlyCycle,
}

/// Durable store location.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub state_db_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load from a TOML file with `LIRABOT_`-prefixed environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("LIRABOT").separator("__"))
            .build()?;
        let app: AppConfig = cfg.try_deserialize()?;
        app.validate_strict()?;
        Ok(app)
    }

    /// Aggregate section validation; fail fast on the first report.
    pub fn validate_strict(&self) -> Result<()> {
        let mut errors = Vec::new();
        errors.extend(self.agent.validate());
        errors.extend(self.safety.validate());
        errors.extend(self.risk.validate());
        errors.extend(self.capital.validate());
        errors.extend(self.execution.validate());
        errors.extend(self.transport.validate());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(LirabotError::InvalidConfig(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config() -> AppConfig {
        AppConfig {
            agent: AgentConfig {
                account_key: "acct-1".into(),
                quote_currency: default_quote_currency(),
                universe: vec!["BTC".into()],
                cycle_interval_secs: 15,
                process_role: default_process_role(),
                strategy_id: default_strategy_id(),
            },
            safety: SafetyConfig::default(),
            risk: RiskConfig::default(),
            capital: CapitalConfig::default(),
            execution: ExecutionConfig::default(),
            transport: TransportConfig::default(),
            rules: RulesConfig::default(),
            database: DatabaseConfig {
                state_db_path: ":memory:".into(),
            },
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(base_config().validate_strict().is_ok());
    }

    #[test]
    fn capital_ratios_must_sum_to_one() {
        let mut cfg = base_config();
        cfg.capital.profit_compound_ratio = dec!(0.70);
        assert!(cfg.validate_strict().is_err());

        cfg.capital.profit_treasury_ratio = dec!(0.30);
        assert!(cfg.validate_strict().is_ok());
    }

    #[test]
    fn wrong_ack_literal_is_rejected_at_load() {
        let mut cfg = base_config();
        cfg.safety.dry_run = false;
        cfg.safety.live_trading = true;
        cfg.safety.live_trading_ack = "i understand".into();
        assert!(cfg.validate_strict().is_err());

        cfg.safety.live_trading_ack = "I_UNDERSTAND".into();
        assert!(cfg.validate_strict().is_ok());
    }

    #[test]
    fn contradictory_live_and_dry_run_rejected() {
        let mut cfg = base_config();
        cfg.safety.live_trading = true;
        cfg.safety.dry_run = true;
        cfg.safety.live_trading_ack = "I_UNDERSTAND".into();
        assert!(cfg.validate_strict().is_err());
    }

    #[test]
    fn cycle_cadence_bounds() {
        let mut cfg = base_config();
        cfg.agent.cycle_interval_secs = 0;
        assert!(cfg.validate_strict().is_err());
        cfg.agent.cycle_interval_secs = 61;
        assert!(cfg.validate_strict().is_err());
        cfg.agent.cycle_interval_secs = 60;
        assert!(cfg.validate_strict().is_ok());
    }

    #[test]
    fn invalid_metadata_policy_parses_from_snake_case() {
        let p: InvalidMetadataPolicy = serde_json::from_str("\"observe_only_cycle\"").unwrap();
        assert_eq!(p, InvalidMetadataPolicy::ObserveOnlyCycle);
        assert_eq!(
            InvalidMetadataPolicy::default(),
            InvalidMetadataPolicy::SkipSymbol
        );
    }
}
