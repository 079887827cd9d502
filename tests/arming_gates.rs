//! Arming-gate laws at the public API surface: the four-flag AND condition,
//! kill-switch dominance, and the exact acknowledgement literal.

use lirabot::config::SafetyConfig;
use lirabot::safety::{evaluate, GateReason, RuntimeFlags, LIVE_ACK_LITERAL};

fn config(kill: bool, dry: bool, live: bool, ack: &str, safe: bool) -> SafetyConfig {
    SafetyConfig {
        kill_switch: kill,
        dry_run: dry,
        live_trading: live,
        live_trading_ack: ack.to_string(),
        safe_mode: safe,
        stage_enabled: true,
    }
}

/// Live writes are permitted iff every gate passes; any failing flag blocks
/// both submit and cancel paths (the engine consults the same evaluator for
/// both).
#[test]
fn live_writes_iff_all_four_gates_pass() {
    for kill in [false, true] {
        for dry in [false, true] {
            for live in [false, true] {
                for ack in ["", "I_UNDERSTAND", "i_understand"] {
                    for safe in [false, true] {
                        let decision = evaluate(
                            &config(kill, dry, live, ack, safe),
                            RuntimeFlags::default(),
                        );
                        let armed =
                            !kill && !dry && live && ack == LIVE_ACK_LITERAL && !safe;
                        assert_eq!(
                            decision.live_writes_allowed, armed,
                            "kill={} dry={} live={} ack={:?} safe={}",
                            kill, dry, live, ack, safe
                        );
                    }
                }
            }
        }
    }
}

/// `kill_switch=true` blocks writes regardless of every other flag.
#[test]
fn kill_switch_dominates() {
    for dry in [false, true] {
        for live in [false, true] {
            for ack in ["", LIVE_ACK_LITERAL] {
                let decision = evaluate(
                    &config(true, dry, live, ack, false),
                    RuntimeFlags::default(),
                );
                assert!(decision.blocked());
                assert_eq!(decision.reasons[0], GateReason::KillSwitch);
            }
        }
    }
}

/// Runtime flags can only tighten the configured gates, never loosen them.
#[test]
fn runtime_flags_only_tighten() {
    let armed = config(false, false, true, LIVE_ACK_LITERAL, false);

    let decision = evaluate(
        &armed,
        RuntimeFlags {
            kill_switch_engaged: true,
            safe_mode_engaged: false,
        },
    );
    assert!(decision.blocked());

    // A disarmed config stays disarmed no matter what the runtime says.
    let disarmed = config(false, true, false, "", false);
    let decision = evaluate(&disarmed, RuntimeFlags::default());
    assert!(decision.blocked());
    assert!(decision.reasons.contains(&GateReason::DryRun));
    assert!(decision.reasons.contains(&GateReason::LiveNotArmed));
}

/// The acknowledgement is exact literal equality, not case- or
/// whitespace-insensitive matching.
#[test]
fn ack_requires_exact_literal() {
    for near_miss in [
        "i_understand",
        "I_UNDERSTAND ",
        " I_UNDERSTAND",
        "I-UNDERSTAND",
        "I UNDERSTAND",
        "yes",
    ] {
        let decision = evaluate(
            &config(false, false, true, near_miss, false),
            RuntimeFlags::default(),
        );
        assert!(
            decision.reasons.contains(&GateReason::LiveNotArmed),
            "{:?} must not arm",
            near_miss
        );
    }
}

/// Reason codes are stable strings; operators and the cycle trace rely on
/// them.
#[test]
fn reason_codes_are_stable() {
    let decision = evaluate(&config(true, true, false, "", true), RuntimeFlags::default());
    assert_eq!(
        decision.reason_codes(),
        vec!["KILL_SWITCH", "DRY_RUN", "LIVE_NOT_ARMED", "SAFE_MODE"]
    );
}
