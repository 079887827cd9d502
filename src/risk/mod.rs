//! Risk engine: per-intent filters and the system-wide mode decision.
//!
//! Filters run in declared order and the first violation rejects the intent
//! with a stable reason code. The mode decision only tightens while a
//! cooldown is active; relaxation waits for expiry even when every
//! condition has cleared.

pub mod capital;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::domain::ids;
use crate::domain::{Intent, Position, RiskDecision, RiskMode, RiskReason, Side, Symbol};

pub use capital::{budget_limits, checkpoint, BudgetLimits};

/// Verdict for one intent after the filter pipeline.
#[derive(Debug, Clone)]
pub enum FilterVerdict {
    /// Admitted, possibly with a down-capped quantity
    Admitted(Intent),
    /// Rejected with a stable reason code
    Rejected { intent: Intent, reason_code: String },
}

impl FilterVerdict {
    pub fn admitted(&self) -> Option<&Intent> {
        match self {
            FilterVerdict::Admitted(intent) => Some(intent),
            FilterVerdict::Rejected { .. } => None,
        }
    }

    pub fn reason_code(&self) -> Option<&str> {
        match self {
            FilterVerdict::Admitted(_) => None,
            FilterVerdict::Rejected { reason_code, .. } => Some(reason_code),
        }
    }
}

/// Everything the filter pipeline reads. Assembled by the orchestrator;
/// the pipeline itself is pure.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub mode: RiskMode,
    pub open_orders_per_symbol: HashMap<Symbol, usize>,
    pub last_intent_ts: HashMap<(Symbol, Side), DateTime<Utc>>,
    pub positions: HashMap<Symbol, Position>,
    pub free_cash_try: Decimal,
    pub cash_reserve_try: Decimal,
    pub budget: Option<BudgetLimits>,
    pub now: DateTime<Utc>,
}

/// Apply the pre-trade filters in declared order.
///
/// Under REDUCE_RISK_ONLY the turnover allocation (cycle cap, cash) walks
/// SELLs before BUYs; output order still mirrors input order.
pub fn apply_filters(
    intents: Vec<Intent>,
    ctx: &FilterContext,
    cfg: &RiskConfig,
) -> Vec<FilterVerdict> {
    let mut verdicts: Vec<Option<FilterVerdict>> = vec![None; intents.len()];

    // Processing order: sells first under ReduceRiskOnly, input order
    // otherwise.
    let mut order: Vec<usize> = (0..intents.len()).collect();
    if ctx.mode == RiskMode::ReduceRiskOnly {
        order.sort_by_key(|&i| match intents[i].side {
            Side::Sell => 0u8,
            Side::Buy => 1u8,
        });
    }

    let effective_max_order_notional = ctx
        .budget
        .map(|b| b.max_order_notional_try.min(cfg.max_notional_per_order_try))
        .unwrap_or(cfg.max_notional_per_order_try);

    let mut cycle_notional_used = Decimal::ZERO;
    let mut buy_notional_admitted = Decimal::ZERO;
    let mut admitted_count = 0usize;

    for position_in_order in order {
        let intent = &intents[position_in_order];
        let verdict = filter_one(
            intent,
            position_in_order,
            ctx,
            cfg,
            effective_max_order_notional,
            &mut cycle_notional_used,
            &mut buy_notional_admitted,
            &mut admitted_count,
        );
        verdicts[position_in_order] = Some(verdict);
    }

    verdicts.into_iter().map(|v| v.expect("all set")).collect()
}

#[allow(clippy::too_many_arguments)]
fn filter_one(
    intent: &Intent,
    input_position: usize,
    ctx: &FilterContext,
    cfg: &RiskConfig,
    max_order_notional: Decimal,
    cycle_notional_used: &mut Decimal,
    buy_notional_admitted: &mut Decimal,
    admitted_count: &mut usize,
) -> FilterVerdict {
    let reject = |reason: &str| FilterVerdict::Rejected {
        intent: intent.clone(),
        reason_code: reason.to_string(),
    };

    // Mode gate before the numbered filters: observe-only plans only,
    // reduce-risk-only blocks buys.
    match ctx.mode {
        RiskMode::ObserveOnly => return reject("mode_observe_only"),
        RiskMode::ReduceRiskOnly if intent.side == Side::Buy => {
            return reject("mode_reduce_risk_only")
        }
        _ => {}
    }

    // 1. Per-cycle order budget truncates by input position.
    if input_position >= cfg.max_orders_per_cycle || *admitted_count >= cfg.max_orders_per_cycle {
        return reject("max_orders_per_cycle");
    }

    // 2. Per-symbol open order cap.
    let open = ctx
        .open_orders_per_symbol
        .get(&intent.symbol)
        .copied()
        .unwrap_or(0);
    if open >= cfg.max_open_orders_per_symbol {
        return reject("max_open_orders_per_symbol");
    }

    // 3. Cooldown per (symbol, side).
    if let Some(last) = ctx.last_intent_ts.get(&(intent.symbol.clone(), intent.side)) {
        if ctx.now - *last < Duration::seconds(cfg.cooldown_seconds) {
            return reject("cooldown");
        }
    }

    // 4. Per-order notional down-cap.
    let mut qty = intent.target_qty;
    let mut notional = intent.notional();
    if notional > max_order_notional && intent.target_price > Decimal::ZERO {
        qty = (max_order_notional / intent.target_price).normalize();
        notional = (intent.target_price * qty).normalize();
    }
    if notional < cfg.min_order_notional_try {
        return reject("below_min_notional");
    }

    // 5. Greedy cycle notional cap.
    if *cycle_notional_used + notional > cfg.notional_cap_per_cycle_try {
        return reject("cycle_notional_cap");
    }

    // 6. Investable cash (buys only).
    if intent.side == Side::Buy {
        let investable = (ctx.free_cash_try - ctx.cash_reserve_try).max(Decimal::ZERO);
        if *buy_notional_admitted + notional > investable {
            return reject("investable_cash");
        }
    }

    // 7. Minimum profit threshold for sells.
    if intent.side == Side::Sell {
        let avg_cost = ctx
            .positions
            .get(&intent.symbol)
            .map(|p| p.avg_cost)
            .unwrap_or_default();
        if avg_cost > Decimal::ZERO {
            let bps =
                (cfg.fee_bps_taker + cfg.slippage_bps_buffer + cfg.min_profit_bps) / dec_bps();
            let required = avg_cost * (Decimal::ONE + bps);
            if intent.target_price < required {
                return reject("min_profit_threshold");
            }
        }
    }

    *cycle_notional_used += notional;
    if intent.side == Side::Buy {
        *buy_notional_admitted += notional;
    }
    *admitted_count += 1;

    let mut admitted = intent.clone();
    admitted.target_qty = qty;
    FilterVerdict::Admitted(admitted)
}

fn dec_bps() -> Decimal {
    Decimal::from(10_000)
}

/// Inputs for the mode ladder. Pure data; the orchestrator gathers them.
#[derive(Debug, Clone, Default)]
pub struct ModeInputs {
    pub kill_switch_blocked: bool,
    pub drawdown: Decimal,
    pub realized_today_try: Decimal,
    pub fees_today_try: Decimal,
    pub gross_exposure_try: Decimal,
    pub largest_position_pct: Decimal,
    pub consecutive_loss_streak: u32,
    pub market_data_age_ms: i64,
    pub max_spread_bps: Decimal,
    pub unknown_escalation_active: bool,
    pub rules_force_observe_only: bool,
}

impl ModeInputs {
    fn hash(&self) -> String {
        ids::inputs_hash(&[
            self.kill_switch_blocked.to_string(),
            ids::canonical_decimal(self.drawdown),
            ids::canonical_decimal(self.realized_today_try),
            ids::canonical_decimal(self.fees_today_try),
            ids::canonical_decimal(self.gross_exposure_try),
            ids::canonical_decimal(self.largest_position_pct),
            self.consecutive_loss_streak.to_string(),
            self.market_data_age_ms.to_string(),
            ids::canonical_decimal(self.max_spread_bps),
            self.unknown_escalation_active.to_string(),
            self.rules_force_observe_only.to_string(),
        ])
    }
}

/// Previous decision state carried between cycles for cooldown monotonicity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrevModeState {
    pub mode: Option<RiskMode>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Decide the cycle's mode. Strictly monotonic while a cooldown is active:
/// the decided mode can only tighten relative to the previous one.
pub fn decide_mode(
    inputs: &ModeInputs,
    cfg: &RiskConfig,
    prev: PrevModeState,
    market_data_max_age_ms: i64,
    now: DateTime<Utc>,
) -> RiskDecision {
    let mut mode = RiskMode::Normal;
    let mut reasons = Vec::new();
    let mut cooldown_until = None;

    if inputs.kill_switch_blocked {
        mode = mode.tighten(RiskMode::ObserveOnly);
        reasons.push(RiskReason::KillSwitch);
    }

    if inputs.drawdown >= cfg.max_drawdown
        || inputs.realized_today_try <= -cfg.max_daily_loss_try
    {
        mode = mode.tighten(RiskMode::ObserveOnly);
        reasons.push(RiskReason::DrawdownLimit);
        cooldown_until = Some(now + Duration::seconds(cfg.breaker_cooldown_seconds));
    }

    if inputs.unknown_escalation_active {
        mode = mode.tighten(RiskMode::ObserveOnly);
        reasons.push(RiskReason::UnknownOrderEscalation);
    }

    if inputs.gross_exposure_try > cfg.max_gross_exposure_try
        || inputs.largest_position_pct > cfg.max_position_pct
    {
        mode = mode.tighten(RiskMode::ReduceRiskOnly);
        reasons.push(RiskReason::ExposureLimit);
    }

    if inputs.fees_today_try > cfg.max_fee_per_day_try {
        mode = mode.tighten(RiskMode::ReduceRiskOnly);
        reasons.push(RiskReason::FeeBudget);
    }

    if inputs.consecutive_loss_streak >= cfg.max_consecutive_losses {
        let response = if cfg.escalate_loss_streak_to_observe {
            RiskMode::ObserveOnly
        } else {
            RiskMode::ReduceRiskOnly
        };
        mode = mode.tighten(response);
        reasons.push(RiskReason::LossStreak);
    }

    if inputs.market_data_age_ms > market_data_max_age_ms
        || inputs.max_spread_bps > cfg.spread_spike_bps
        || inputs.rules_force_observe_only
    {
        let response = if inputs.rules_force_observe_only {
            RiskMode::ObserveOnly
        } else {
            RiskMode::ReduceRiskOnly
        };
        mode = mode.tighten(response);
        reasons.push(RiskReason::MarketDataAnomaly);
    }

    // Cooldown latch: inside the previous cooldown the mode cannot relax.
    if let (Some(prev_mode), Some(until)) = (prev.mode, prev.cooldown_until) {
        if now < until && mode > prev_mode {
            mode = prev_mode;
            reasons.push(RiskReason::CooldownActive);
            cooldown_until = Some(cooldown_until.map_or(until, |c: DateTime<Utc>| c.max(until)));
        } else if now < until {
            cooldown_until = Some(cooldown_until.map_or(until, |c: DateTime<Utc>| c.max(until)));
        }
    }

    if mode == RiskMode::Normal {
        info!("risk mode NORMAL");
    } else {
        warn!(mode = %mode, reasons = ?reasons, "risk mode restricted");
    }

    RiskDecision {
        mode,
        reasons,
        cooldown_until,
        inputs_hash: inputs.hash(),
        decided_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IntentReason;
    use rust_decimal_macros::dec;

    fn intent(base: &str, side: Side, price: Decimal, qty: Decimal) -> Intent {
        Intent {
            symbol: Symbol::try_base(base),
            side,
            target_price: price,
            target_qty: qty,
            reason: IntentReason::Entry,
            strategy_id: "s1".into(),
            idempotency_seed: "seed".into(),
        }
    }

    fn ctx(mode: RiskMode) -> FilterContext {
        FilterContext {
            mode,
            open_orders_per_symbol: HashMap::new(),
            last_intent_ts: HashMap::new(),
            positions: HashMap::new(),
            free_cash_try: dec!(100000),
            cash_reserve_try: Decimal::ZERO,
            budget: None,
            now: Utc::now(),
        }
    }

    fn cfg() -> RiskConfig {
        RiskConfig::default()
    }

    // ==================== Filters ====================

    #[test]
    fn buy_blocked_in_reduce_risk_only() {
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Buy, dec!(1000000), dec!(0.001))],
            &ctx(RiskMode::ReduceRiskOnly),
            &cfg(),
        );
        assert_eq!(verdicts[0].reason_code(), Some("mode_reduce_risk_only"));
    }

    #[test]
    fn everything_blocked_in_observe_only() {
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Sell, dec!(1000000), dec!(0.001))],
            &ctx(RiskMode::ObserveOnly),
            &cfg(),
        );
        assert_eq!(verdicts[0].reason_code(), Some("mode_observe_only"));
    }

    #[test]
    fn order_budget_truncates_by_position() {
        let mut cfg = cfg();
        cfg.max_orders_per_cycle = 2;
        let intents = vec![
            intent("BTC", Side::Buy, dec!(1000), dec!(1)),
            intent("ETH", Side::Buy, dec!(1000), dec!(1)),
            intent("SOL", Side::Buy, dec!(1000), dec!(1)),
        ];
        let verdicts = apply_filters(intents, &ctx(RiskMode::Normal), &cfg);
        assert!(verdicts[0].admitted().is_some());
        assert!(verdicts[1].admitted().is_some());
        assert_eq!(verdicts[2].reason_code(), Some("max_orders_per_cycle"));
    }

    #[test]
    fn open_order_cap_per_symbol() {
        let mut ctx = ctx(RiskMode::Normal);
        ctx.open_orders_per_symbol
            .insert(Symbol::try_base("BTC"), 2);
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Buy, dec!(1000), dec!(1))],
            &ctx,
            &cfg(),
        );
        assert_eq!(verdicts[0].reason_code(), Some("max_open_orders_per_symbol"));
    }

    #[test]
    fn cooldown_rejects_recent_symbol_side() {
        let mut ctx = ctx(RiskMode::Normal);
        ctx.last_intent_ts.insert(
            (Symbol::try_base("BTC"), Side::Buy),
            ctx.now - Duration::seconds(30),
        );
        let verdicts = apply_filters(
            vec![
                intent("BTC", Side::Buy, dec!(1000), dec!(1)),
                intent("BTC", Side::Sell, dec!(1000), dec!(1)),
            ],
            &ctx,
            &cfg(),
        );
        assert_eq!(verdicts[0].reason_code(), Some("cooldown"));
        // Opposite side is unaffected.
        assert!(verdicts[1].admitted().is_some());
    }

    #[test]
    fn oversized_order_is_down_capped() {
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Buy, dec!(1000), dec!(10))], // 10,000 > 5,000
            &ctx(RiskMode::Normal),
            &cfg(),
        );
        let admitted = verdicts[0].admitted().expect("should admit capped");
        assert_eq!(admitted.target_qty, dec!(5));
        assert_eq!(admitted.notional(), dec!(5000));
    }

    #[test]
    fn dust_after_cap_is_rejected() {
        let mut cfg = cfg();
        cfg.min_order_notional_try = dec!(100);
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Buy, dec!(1000), dec!(0.05))], // 50 < 100
            &ctx(RiskMode::Normal),
            &cfg,
        );
        assert_eq!(verdicts[0].reason_code(), Some("below_min_notional"));
    }

    #[test]
    fn cycle_cap_admits_greedily_in_order() {
        let mut cfg = cfg();
        cfg.notional_cap_per_cycle_try = dec!(7000);
        let intents = vec![
            intent("BTC", Side::Buy, dec!(1000), dec!(4)), // 4,000 admitted
            intent("ETH", Side::Buy, dec!(1000), dec!(4)), // would exceed 7,000
            intent("SOL", Side::Buy, dec!(1000), dec!(2)), // 2,000 fits
        ];
        let verdicts = apply_filters(intents, &ctx(RiskMode::Normal), &cfg);
        assert!(verdicts[0].admitted().is_some());
        assert_eq!(verdicts[1].reason_code(), Some("cycle_notional_cap"));
        assert!(verdicts[2].admitted().is_some());
    }

    #[test]
    fn investable_cash_limits_buys_not_sells() {
        let mut ctx = ctx(RiskMode::Normal);
        ctx.free_cash_try = dec!(1500);
        let intents = vec![
            intent("BTC", Side::Buy, dec!(1000), dec!(1)),  // 1,000 ok
            intent("ETH", Side::Buy, dec!(1000), dec!(1)),  // exceeds cash
            intent("BTC", Side::Sell, dec!(1000), dec!(1)), // sells free cash
        ];
        let verdicts = apply_filters(intents, &ctx, &cfg());
        assert!(verdicts[0].admitted().is_some());
        assert_eq!(verdicts[1].reason_code(), Some("investable_cash"));
        assert!(verdicts[2].admitted().is_some());
    }

    #[test]
    fn sell_below_profit_threshold_is_rejected() {
        let mut ctx = ctx(RiskMode::Normal);
        ctx.positions.insert(
            Symbol::try_base("BTC"),
            Position {
                qty: dec!(0.01),
                avg_cost: dec!(1000000),
                realized_pnl_try: Decimal::ZERO,
                unrealized_pnl_try: Decimal::ZERO,
            },
        );
        // Required: 1,000,000 * (1 + 78/10,000) = 1,007,800
        let below = apply_filters(
            vec![intent("BTC", Side::Sell, dec!(1007000), dec!(0.01))],
            &ctx,
            &cfg(),
        );
        assert_eq!(below[0].reason_code(), Some("min_profit_threshold"));

        let above = apply_filters(
            vec![intent("BTC", Side::Sell, dec!(1010000), dec!(0.01))],
            &ctx,
            &cfg(),
        );
        assert!(above[0].admitted().is_some());
    }

    #[test]
    fn sells_allocate_before_buys_under_reduce_risk_only() {
        let mut cfg = cfg();
        cfg.notional_cap_per_cycle_try = dec!(1000);
        // Input order puts the buy first; the sell must still win the
        // allocation and the buy is mode-blocked anyway.
        let intents = vec![
            intent("BTC", Side::Buy, dec!(1000), dec!(1)),
            intent("ETH", Side::Sell, dec!(1000), dec!(1)),
        ];
        let verdicts = apply_filters(intents, &ctx(RiskMode::ReduceRiskOnly), &cfg);
        assert_eq!(verdicts[0].reason_code(), Some("mode_reduce_risk_only"));
        assert!(verdicts[1].admitted().is_some());
    }

    #[test]
    fn budget_tightens_order_notional() {
        let mut ctx = ctx(RiskMode::Normal);
        ctx.budget = Some(BudgetLimits {
            max_exposure_try: dec!(10000),
            max_order_notional_try: dec!(2000),
        });
        let verdicts = apply_filters(
            vec![intent("BTC", Side::Buy, dec!(1000), dec!(4))],
            &ctx,
            &cfg(),
        );
        let admitted = verdicts[0].admitted().unwrap();
        assert_eq!(admitted.notional(), dec!(2000));
    }

    // ==================== Mode decision ====================

    fn base_inputs() -> ModeInputs {
        ModeInputs::default()
    }

    #[test]
    fn clean_inputs_decide_normal() {
        let decision = decide_mode(
            &base_inputs(),
            &cfg(),
            PrevModeState::default(),
            10_000,
            Utc::now(),
        );
        assert_eq!(decision.mode, RiskMode::Normal);
        assert!(decision.reasons.is_empty());
    }

    #[test]
    fn kill_switch_forces_observe_only() {
        let inputs = ModeInputs {
            kill_switch_blocked: true,
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), PrevModeState::default(), 10_000, Utc::now());
        assert_eq!(decision.mode, RiskMode::ObserveOnly);
        assert_eq!(decision.reasons, vec![RiskReason::KillSwitch]);
    }

    #[test]
    fn drawdown_breach_applies_cooldown() {
        let inputs = ModeInputs {
            drawdown: dec!(0.20),
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), PrevModeState::default(), 10_000, Utc::now());
        assert_eq!(decision.mode, RiskMode::ObserveOnly);
        assert!(decision.cooldown_until.is_some());
        assert!(decision.reasons.contains(&RiskReason::DrawdownLimit));
    }

    #[test]
    fn exposure_breach_reduces_risk() {
        let inputs = ModeInputs {
            gross_exposure_try: dec!(60000),
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), PrevModeState::default(), 10_000, Utc::now());
        assert_eq!(decision.mode, RiskMode::ReduceRiskOnly);
        assert_eq!(decision.reasons, vec![RiskReason::ExposureLimit]);
    }

    #[test]
    fn loss_streak_can_escalate_to_observe() {
        let inputs = ModeInputs {
            consecutive_loss_streak: 5,
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), PrevModeState::default(), 10_000, Utc::now());
        assert_eq!(decision.mode, RiskMode::ReduceRiskOnly);

        let mut escalating = cfg();
        escalating.escalate_loss_streak_to_observe = true;
        let decision = decide_mode(
            &inputs,
            &escalating,
            PrevModeState::default(),
            10_000,
            Utc::now(),
        );
        assert_eq!(decision.mode, RiskMode::ObserveOnly);
    }

    #[test]
    fn stale_market_data_degrades() {
        let inputs = ModeInputs {
            market_data_age_ms: 60_000,
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), PrevModeState::default(), 10_000, Utc::now());
        assert_eq!(decision.mode, RiskMode::ReduceRiskOnly);
        assert_eq!(decision.reasons, vec![RiskReason::MarketDataAnomaly]);
    }

    #[test]
    fn cooldown_blocks_relaxation_until_expiry() {
        let now = Utc::now();
        let prev = PrevModeState {
            mode: Some(RiskMode::ObserveOnly),
            cooldown_until: Some(now + Duration::seconds(600)),
        };
        // All conditions clear, but the cooldown holds OBSERVE_ONLY.
        let decision = decide_mode(&base_inputs(), &cfg(), prev, 10_000, now);
        assert_eq!(decision.mode, RiskMode::ObserveOnly);
        assert!(decision.reasons.contains(&RiskReason::CooldownActive));
        assert_eq!(decision.cooldown_until, prev.cooldown_until);

        // After expiry the mode relaxes.
        let later = now + Duration::seconds(601);
        let decision = decide_mode(&base_inputs(), &cfg(), prev, 10_000, later);
        assert_eq!(decision.mode, RiskMode::Normal);
    }

    #[test]
    fn cooldown_never_prevents_tightening() {
        let now = Utc::now();
        let prev = PrevModeState {
            mode: Some(RiskMode::ReduceRiskOnly),
            cooldown_until: Some(now + Duration::seconds(600)),
        };
        let inputs = ModeInputs {
            kill_switch_blocked: true,
            ..base_inputs()
        };
        let decision = decide_mode(&inputs, &cfg(), prev, 10_000, now);
        assert_eq!(decision.mode, RiskMode::ObserveOnly);
    }

    #[test]
    fn inputs_hash_is_stable() {
        let a = base_inputs().hash();
        let b = base_inputs().hash();
        assert_eq!(a, b);
        let c = ModeInputs {
            drawdown: dec!(0.01),
            ..base_inputs()
        }
        .hash();
        assert_ne!(a, c);
    }
}
