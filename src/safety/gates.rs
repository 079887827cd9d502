//! Arming gates for live execution.
//!
//! Live writes require every gate to pass: kill switch off, dry-run off,
//! live trading on, and the exact acknowledgement literal. `safe_mode`
//! blocks writes on top of the four gates. Evaluation is a pure function
//! over settings and runtime flags; it runs at config load, at cycle start,
//! and immediately before every exchange write.

use serde::{Deserialize, Serialize};

use crate::config::SafetyConfig;

/// Exact literal the operator must set to arm live trading.
pub const LIVE_ACK_LITERAL: &str = "I_UNDERSTAND";

/// Why a gate blocked live execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateReason {
    KillSwitch,
    DryRun,
    LiveNotArmed,
    SafeMode,
}

impl GateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateReason::KillSwitch => "KILL_SWITCH",
            GateReason::DryRun => "DRY_RUN",
            GateReason::LiveNotArmed => "LIVE_NOT_ARMED",
            GateReason::SafeMode => "SAFE_MODE",
        }
    }
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flags an operator can flip at runtime without a config reload. They can
/// only tighten, never loosen, the configured gates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeFlags {
    pub kill_switch_engaged: bool,
    pub safe_mode_engaged: bool,
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub live_writes_allowed: bool,
    /// Blocking reasons in evaluation order; empty iff armed
    pub reasons: Vec<GateReason>,
}

impl GateDecision {
    pub fn blocked(&self) -> bool {
        !self.live_writes_allowed
    }

    pub fn reason_codes(&self) -> Vec<&'static str> {
        self.reasons.iter().map(|r| r.as_str()).collect()
    }
}

/// Evaluate the arming gates. Pure; call sites must not cache the result
/// across an await point that could change the runtime flags.
pub fn evaluate(safety: &SafetyConfig, runtime: RuntimeFlags) -> GateDecision {
    let mut reasons = Vec::new();

    if safety.kill_switch || runtime.kill_switch_engaged {
        reasons.push(GateReason::KillSwitch);
    }
    if safety.dry_run {
        reasons.push(GateReason::DryRun);
    }
    if !safety.live_trading || safety.live_trading_ack != LIVE_ACK_LITERAL {
        reasons.push(GateReason::LiveNotArmed);
    }
    if safety.safe_mode || runtime.safe_mode_engaged {
        reasons.push(GateReason::SafeMode);
    }

    GateDecision {
        live_writes_allowed: reasons.is_empty(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed() -> SafetyConfig {
        SafetyConfig {
            kill_switch: false,
            dry_run: false,
            live_trading: true,
            live_trading_ack: LIVE_ACK_LITERAL.to_string(),
            safe_mode: false,
            stage_enabled: true,
        }
    }

    #[test]
    fn fully_armed_allows_writes() {
        let decision = evaluate(&armed(), RuntimeFlags::default());
        assert!(decision.live_writes_allowed);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn every_gate_combination_matches_the_and_condition() {
        for kill in [false, true] {
            for dry in [false, true] {
                for live in [false, true] {
                    for ack_ok in [false, true] {
                        let cfg = SafetyConfig {
                            kill_switch: kill,
                            dry_run: dry,
                            live_trading: live,
                            live_trading_ack: if ack_ok {
                                LIVE_ACK_LITERAL.to_string()
                            } else {
                                "nope".to_string()
                            },
                            safe_mode: false,
                            stage_enabled: true,
                        };
                        let expect = !kill && !dry && live && ack_ok;
                        let decision = evaluate(&cfg, RuntimeFlags::default());
                        assert_eq!(
                            decision.live_writes_allowed, expect,
                            "kill={} dry={} live={} ack_ok={}",
                            kill, dry, live, ack_ok
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn kill_switch_dominates_all_other_flags() {
        let mut cfg = armed();
        cfg.kill_switch = true;
        let decision = evaluate(&cfg, RuntimeFlags::default());
        assert!(decision.blocked());
        assert_eq!(decision.reasons, vec![GateReason::KillSwitch]);
    }

    #[test]
    fn runtime_kill_switch_tightens_armed_config() {
        let decision = evaluate(
            &armed(),
            RuntimeFlags {
                kill_switch_engaged: true,
                safe_mode_engaged: false,
            },
        );
        assert!(decision.blocked());
        assert_eq!(decision.reasons, vec![GateReason::KillSwitch]);
    }

    #[test]
    fn ack_literal_must_match_exactly() {
        for bad in ["i_understand", "I_UNDERSTAND ", "I UNDERSTAND", ""] {
            let mut cfg = armed();
            cfg.live_trading_ack = bad.to_string();
            let decision = evaluate(&cfg, RuntimeFlags::default());
            assert!(decision.blocked(), "ack {:?} should block", bad);
            assert!(decision.reasons.contains(&GateReason::LiveNotArmed));
        }
    }

    #[test]
    fn safe_mode_blocks_even_when_armed() {
        let mut cfg = armed();
        cfg.safe_mode = true;
        let decision = evaluate(&cfg, RuntimeFlags::default());
        assert!(decision.blocked());
        assert_eq!(decision.reasons, vec![GateReason::SafeMode]);
    }

    #[test]
    fn reasons_accumulate_in_evaluation_order() {
        let cfg = SafetyConfig {
            kill_switch: true,
            dry_run: true,
            live_trading: false,
            live_trading_ack: String::new(),
            safe_mode: true,
            stage_enabled: true,
        };
        let decision = evaluate(&cfg, RuntimeFlags::default());
        assert_eq!(
            decision.reasons,
            vec![
                GateReason::KillSwitch,
                GateReason::DryRun,
                GateReason::LiveNotArmed,
                GateReason::SafeMode
            ]
        );
    }
}
