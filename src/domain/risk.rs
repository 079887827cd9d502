use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// System-wide trading mode. Ordered: ObserveOnly is the tightest, Normal
/// the loosest. "Tighter" compares as less-than.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskMode {
    ObserveOnly,
    ReduceRiskOnly,
    Normal,
}

impl Default for RiskMode {
    fn default() -> Self {
        RiskMode::ObserveOnly
    }
}

impl RiskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskMode::ObserveOnly => "OBSERVE_ONLY",
            RiskMode::ReduceRiskOnly => "REDUCE_RISK_ONLY",
            RiskMode::Normal => "NORMAL",
        }
    }

    /// Whether any exchange write is permitted in this mode.
    pub fn allows_writes(&self) -> bool {
        !matches!(self, RiskMode::ObserveOnly)
    }

    /// Whether a BUY submission is permitted in this mode.
    pub fn allows_buys(&self) -> bool {
        matches!(self, RiskMode::Normal)
    }

    /// The tighter of two modes.
    pub fn tighten(self, other: RiskMode) -> RiskMode {
        self.min(other)
    }
}

impl std::fmt::Display for RiskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RiskMode {
    type Err = &'static str;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OBSERVE_ONLY" => Ok(RiskMode::ObserveOnly),
            "REDUCE_RISK_ONLY" => Ok(RiskMode::ReduceRiskOnly),
            "NORMAL" => Ok(RiskMode::Normal),
            _ => Err("invalid risk mode"),
        }
    }
}

/// Stable reason codes carried by a risk decision, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReason {
    KillSwitch,
    DrawdownLimit,
    ExposureLimit,
    FeeBudget,
    LossStreak,
    MarketDataAnomaly,
    UnknownOrderEscalation,
    CooldownActive,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::KillSwitch => "KILL_SWITCH",
            RiskReason::DrawdownLimit => "DRAWDOWN_LIMIT",
            RiskReason::ExposureLimit => "EXPOSURE_LIMIT",
            RiskReason::FeeBudget => "FEE_BUDGET",
            RiskReason::LossStreak => "LOSS_STREAK",
            RiskReason::MarketDataAnomaly => "MARKET_DATA_ANOMALY",
            RiskReason::UnknownOrderEscalation => "UNKNOWN_ORDER_ESCALATION",
            RiskReason::CooldownActive => "COOLDOWN_ACTIVE",
        }
    }
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output of the mode decision, persisted with each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDecision {
    pub mode: RiskMode,
    /// Ordered, deduplicated reason codes
    pub reasons: Vec<RiskReason>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub inputs_hash: String,
    pub decided_at: DateTime<Utc>,
}

impl RiskDecision {
    pub fn normal(inputs_hash: String, decided_at: DateTime<Utc>) -> Self {
        Self {
            mode: RiskMode::Normal,
            reasons: Vec::new(),
            cooldown_until: None,
            inputs_hash,
            decided_at,
        }
    }

    pub fn reason_codes(&self) -> Vec<&'static str> {
        self.reasons.iter().map(|r| r.as_str()).collect()
    }
}
