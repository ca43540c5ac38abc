//! Strategy FSM — grid scalping with a late-window opportunistic mode.
//!
//! `evaluate` is a pure function of (prices, positions, time, config) and
//! returns at most one intent per tick. It performs no I/O and mutates
//! nothing: debounce stamps, fills and exit-order state are inputs, and
//! the orchestrator records them after acting on the returned intent.
//!
//! Timing model, in decision order:
//!   < 5 min  — forced unwind of any grid positions, then scalp exits,
//!              then scalp admission. No grid activity.
//!   < 7 min  — exits only; no new grid entries.
//!   ≥ 7 min  — take-profit emission, then grid entries.

use std::env;

use tracing::{debug, warn};

use super::messages::Intent;
use super::types::{target_exit_price, Classification, Position, Side, Urgency};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Grid entry trigger prices on the bought side.
    pub entry_levels: Vec<f64>,
    /// Shares per grid fill.
    pub level_size: f64,
    pub level_profit_target: f64,
    /// Below this many seconds remaining, no new grid entries.
    pub min_entry_secs: f64,
    /// Below this many seconds remaining, grid positions are force-unwound.
    pub force_unwind_secs: f64,
    /// Hard cap on grid round-trips per market.
    pub max_completed_cycles: u32,
    /// Late-window scalp admission threshold on the bought side's ask.
    pub high_scalp_threshold: f64,
    pub high_scalp_size: f64,
    pub high_scalp_profit_target: f64,
    pub max_high_scalps: u32,
    /// Minimum spacing between exit-class intents.
    pub exit_debounce_secs: f64,
    /// A grid level counts as already entered within this distance.
    pub level_tolerance: f64,
    /// Entries are suppressed when yes_ask + no_ask exceeds this.
    pub crossed_book_max: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            entry_levels: vec![0.34, 0.24, 0.14],
            level_size: 10.0,
            level_profit_target: 0.05,
            min_entry_secs: 420.0,
            force_unwind_secs: 300.0,
            max_completed_cycles: 3,
            high_scalp_threshold: 0.85,
            high_scalp_size: 5.0,
            high_scalp_profit_target: 0.02,
            max_high_scalps: 4,
            exit_debounce_secs: 1.0,
            level_tolerance: 0.01,
            crossed_book_max: 1.02,
        }
    }
}

impl StrategyConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = env::var("SCALP_ENTRY_LEVELS") {
            let parsed: Vec<f64> = v.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if !parsed.is_empty() {
                c.entry_levels = parsed;
            }
        }
        if let Ok(v) = env::var("SCALP_LEVEL_SIZE")           { if let Ok(f) = v.parse() { c.level_size = f; } }
        if let Ok(v) = env::var("SCALP_LEVEL_PROFIT_TARGET")  { if let Ok(f) = v.parse() { c.level_profit_target = f; } }
        if let Ok(v) = env::var("SCALP_MIN_ENTRY_SECS")       { if let Ok(f) = v.parse() { c.min_entry_secs = f; } }
        if let Ok(v) = env::var("SCALP_FORCE_UNWIND_SECS")    { if let Ok(f) = v.parse() { c.force_unwind_secs = f; } }
        if let Ok(v) = env::var("SCALP_MAX_CYCLES")           { if let Ok(f) = v.parse() { c.max_completed_cycles = f; } }
        if let Ok(v) = env::var("SCALP_HIGH_THRESHOLD")       { if let Ok(f) = v.parse() { c.high_scalp_threshold = f; } }
        if let Ok(v) = env::var("SCALP_HIGH_SIZE")            { if let Ok(f) = v.parse() { c.high_scalp_size = f; } }
        if let Ok(v) = env::var("SCALP_HIGH_PROFIT_TARGET")   { if let Ok(f) = v.parse() { c.high_scalp_profit_target = f; } }
        if let Ok(v) = env::var("SCALP_MAX_HIGH_SCALPS")      { if let Ok(f) = v.parse() { c.max_high_scalps = f; } }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Evaluation input
// ─────────────────────────────────────────────────────────

/// Read-only snapshot of one market at evaluation time. Assembled by the
/// orchestrator from the book mirror, the ledger and the wall clock.
#[derive(Debug, Clone)]
pub struct MarketView {
    pub token_yes: String,
    pub token_no: String,
    pub yes_bid: f64,
    pub yes_ask: f64,
    pub no_bid: f64,
    pub no_ask: f64,
    pub time_remaining_secs: f64,
    pub positions: Vec<Position>,
    pub completed_cycles: u32,
    pub high_scalps_opened: u32,
    /// (side, level) pairs already triggered and not yet cleared by an
    /// exit fill on that side.
    pub entered_levels: Vec<(Side, f64)>,
    /// A resting take-profit order (or a recent placement failure) exists.
    pub has_active_exit_orders: bool,
    pub secs_since_exit_signal: Option<f64>,
    /// True only on the evaluation that first crossed the unwind gate.
    pub gate_just_crossed: bool,
}

impl MarketView {
    pub fn ask(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.yes_ask,
            Side::No => self.no_ask,
        }
    }

    pub fn bid(&self, side: Side) -> f64 {
        match side {
            Side::Yes => self.yes_bid,
            Side::No => self.no_bid,
        }
    }

    pub fn token(&self, side: Side) -> &str {
        match side {
            Side::Yes => &self.token_yes,
            Side::No => &self.token_no,
        }
    }

    /// (total size, weighted average entry, profit target) for one
    /// side+classification, or None when nothing is held there.
    fn aggregate(&self, side: Side, class: Classification) -> Option<(f64, f64, f64)> {
        let mut size = 0.0;
        let mut cost = 0.0;
        let mut target: f64 = 0.0;
        for p in self
            .positions
            .iter()
            .filter(|p| p.side == side && p.classification == class)
        {
            size += p.size;
            cost += p.size * p.entry_price;
            target = target.max(p.profit_target);
        }
        if size > 0.0 {
            Some((size, cost / size, target))
        } else {
            None
        }
    }

    fn level_size_on(&self, side: Side) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.side == side && p.classification == Classification::Level)
            .map(|p| p.size)
            .sum()
    }

    fn has_open_high_scalp(&self) -> bool {
        self.positions
            .iter()
            .any(|p| p.classification == Classification::HighScalp)
    }

    fn level_position_near(&self, side: Side, level: f64, tol: f64) -> bool {
        self.positions.iter().any(|p| {
            p.side == side
                && p.classification == Classification::Level
                && (p.level - level).abs() <= tol
        })
    }

    fn already_triggered(&self, side: Side, level: f64, tol: f64) -> bool {
        self.entered_levels
            .iter()
            .any(|(s, l)| *s == side && (l - level).abs() <= tol)
    }
}

// ─────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────

pub struct Strategy {
    cfg: StrategyConfig,
}

impl Strategy {
    pub fn new(cfg: StrategyConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.cfg
    }

    /// One evaluation tick. First match wins.
    pub fn evaluate(&self, v: &MarketView) -> Option<Intent> {
        // Not active until both sides have a real ask.
        if v.yes_ask <= 0.0 || v.no_ask <= 0.0 {
            return None;
        }

        if v.time_remaining_secs < self.cfg.force_unwind_secs {
            return self.late_window(v);
        }

        if let Some(intent) = self.check_exit(v) {
            return Some(intent);
        }

        if v.time_remaining_secs < self.cfg.min_entry_secs {
            return None;
        }

        self.check_level_entry(v)
    }

    fn exit_debounced(&self, v: &MarketView) -> bool {
        !v.gate_just_crossed
            && v.secs_since_exit_signal
                .is_some_and(|s| s < self.cfg.exit_debounce_secs)
    }

    // ─────────────────────────────────────────────────
    // < 5 min: forced unwind, scalp exits, scalp admission
    // ─────────────────────────────────────────────────

    fn late_window(&self, v: &MarketView) -> Option<Intent> {
        let yes_lvl = v.level_size_on(Side::Yes);
        let no_lvl = v.level_size_on(Side::No);

        if yes_lvl > 0.0 || no_lvl > 0.0 {
            if yes_lvl > 0.0 && no_lvl > 0.0 {
                // Should not be reachable without manual intervention.
                // Drain the larger side now; the survivor goes next tick.
                warn!(
                    "⚠️ grid positions on BOTH sides (YES {yes_lvl:.1} / NO {no_lvl:.1}) — unwinding larger first"
                );
            }
            if self.exit_debounced(v) {
                return None;
            }
            let side = if yes_lvl >= no_lvl && yes_lvl > 0.0 {
                Side::Yes
            } else {
                Side::No
            };
            let (size, avg, _) = v.aggregate(side, Classification::Level)?;
            let exit_price = v.ask(side.opposite());
            let pnl = size * (1.0 - avg - exit_price);
            warn!(
                "🚨 FORCE UNWIND ({:.0}s left): BUY {} x{:.1}@{:.3} (closing {} avg {:.3}) = ${:+.2}",
                v.time_remaining_secs,
                side.opposite().as_str(),
                size,
                exit_price,
                side.as_str(),
                avg,
                pnl,
            );
            return Some(Intent::Exit {
                side,
                token_id: v.token(side.opposite()).to_string(),
                price: exit_price,
                size,
                classification: Classification::Level,
                urgency: Urgency::Critical,
                fallback_token: v.token(side).to_string(),
                fallback_price: v.bid(side),
            });
        }

        for side in [Side::Yes, Side::No] {
            if let Some((size, avg, pt)) = v.aggregate(side, Classification::HighScalp) {
                let target = target_exit_price(avg, pt);
                let exit_price = v.ask(side.opposite());
                if exit_price > 0.0 && exit_price <= target {
                    if self.exit_debounced(v) {
                        return None;
                    }
                    return Some(Intent::Exit {
                        side,
                        token_id: v.token(side.opposite()).to_string(),
                        price: exit_price,
                        size,
                        classification: Classification::HighScalp,
                        urgency: Urgency::High,
                        fallback_token: v.token(side).to_string(),
                        fallback_price: v.bid(side),
                    });
                }
            }
        }

        // Admission: one scalp at a time, capped per market.
        if v.has_open_high_scalp() || v.has_active_exit_orders {
            return None;
        }
        if v.high_scalps_opened >= self.cfg.max_high_scalps {
            return None;
        }
        for side in [Side::Yes, Side::No] {
            let ask = v.ask(side);
            if ask >= self.cfg.high_scalp_threshold && ask < 1.0 {
                debug!(
                    "🎯 high scalp #{}/{}: {} @ {:.3} ({:.0}s left)",
                    v.high_scalps_opened + 1,
                    self.cfg.max_high_scalps,
                    side.as_str(),
                    ask,
                    v.time_remaining_secs,
                );
                return Some(Intent::EnterHighScalp {
                    side,
                    token_id: v.token(side).to_string(),
                    price: ask,
                    size: self.cfg.high_scalp_size,
                    profit_target: self.cfg.high_scalp_profit_target,
                });
            }
        }

        None
    }

    // ─────────────────────────────────────────────────
    // ≥ 5 min: take-profit emission
    // ─────────────────────────────────────────────────

    fn check_exit(&self, v: &MarketView) -> Option<Intent> {
        if v.positions.is_empty() {
            return None;
        }
        if self.exit_debounced(v) {
            return None;
        }

        for side in [Side::Yes, Side::No] {
            if let Some((size, avg, pt)) = v.aggregate(side, Classification::Level) {
                let target = target_exit_price(avg, pt);
                let exit_price = v.ask(side.opposite());
                if exit_price > 0.0 && exit_price <= target {
                    let pnl = size * (1.0 - avg - exit_price);
                    debug!(
                        "💰 TP met: BUY {} x{:.1}@{:.3} (avg {:.3}, target {:.3}) = ${:+.2}",
                        side.opposite().as_str(),
                        size,
                        exit_price,
                        avg,
                        target,
                        pnl,
                    );
                    return Some(Intent::PlaceTpLimit {
                        side,
                        token_id: v.token(side.opposite()).to_string(),
                        price: exit_price,
                        size,
                    });
                }
            }

            if let Some((size, avg, pt)) = v.aggregate(side, Classification::HighScalp) {
                let target = target_exit_price(avg, pt);
                let exit_price = v.ask(side.opposite());
                if exit_price > 0.0 && exit_price <= target {
                    return Some(Intent::Exit {
                        side,
                        token_id: v.token(side.opposite()).to_string(),
                        price: exit_price,
                        size,
                        classification: Classification::HighScalp,
                        urgency: Urgency::High,
                        fallback_token: v.token(side).to_string(),
                        fallback_price: v.bid(side),
                    });
                }
            }
        }

        None
    }

    // ─────────────────────────────────────────────────
    // ≥ 7 min: grid entries
    // ─────────────────────────────────────────────────

    fn check_level_entry(&self, v: &MarketView) -> Option<Intent> {
        // A resting take-profit (or a placement pending retry) blocks
        // scaling in until it resolves.
        if v.has_active_exit_orders {
            return None;
        }
        if v.completed_cycles >= self.cfg.max_completed_cycles {
            return None;
        }
        if v.yes_ask + v.no_ask > self.cfg.crossed_book_max {
            debug!(
                "❌ book out of line (yes {:.3} + no {:.3} > {:.2}) — no entry",
                v.yes_ask, v.no_ask, self.cfg.crossed_book_max,
            );
            return None;
        }

        let mut levels = self.cfg.entry_levels.clone();
        levels.sort_by(|a, b| a.partial_cmp(b).expect("finite levels"));

        for side in [Side::Yes, Side::No] {
            // Never build a hedged grid book: the other side must hold
            // zero grid positions.
            if v.level_size_on(side.opposite()) > 0.0 {
                continue;
            }
            let ask = v.ask(side);
            for &level in &levels {
                if ask < level
                    && !v.already_triggered(side, level, self.cfg.level_tolerance)
                    && !v.level_position_near(side, level, self.cfg.level_tolerance)
                {
                    debug!(
                        "📈 entry: {} @ {:.3} (below {:.2}) size {:.0}",
                        side.as_str(),
                        ask,
                        level,
                        self.cfg.level_size,
                    );
                    return Some(Intent::EnterLevel {
                        side,
                        token_id: v.token(side).to_string(),
                        price: level,
                        size: self.cfg.level_size,
                        level,
                        profit_target: self.cfg.level_profit_target,
                    });
                }
            }
        }

        None
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
