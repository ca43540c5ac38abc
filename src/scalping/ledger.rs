//! Position ledger — the authoritative record of filled positions.
//!
//! Positions are created only by fill acks and removed only by exit-fill
//! acks; every counter the engine consults is either recomputed from the
//! position list on read or mutated exclusively on those acks. Duplicate
//! acks are dropped via the order id.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use super::types::{Classification, Position, Side};

#[derive(Debug, Default)]
struct MarketPositions {
    positions: Vec<Position>,
    completed_cycles: u32,
    /// Lifetime count of high-scalp entries; bumps only on fill acks.
    high_scalps_opened: u32,
    seen_orders: HashSet<String>,
}

/// What an exit fill removed, for realized-PnL accounting.
#[derive(Debug, Clone, Copy)]
pub struct ExitOutcome {
    pub removed_size: f64,
    pub removed_cost: f64,
    pub cycle_completed: bool,
    pub completed_cycles: u32,
}

#[derive(Debug, Clone)]
pub struct PositionSummary {
    pub side: Side,
    pub total_size: f64,
    pub avg_entry: f64,
    /// Current cost of unwinding the dominant side (the opposite ask).
    pub exit_price: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
    pub num_positions: usize,
}

#[derive(Debug, Default)]
pub struct PositionLedger {
    markets: HashMap<String, MarketPositions>,
}

impl PositionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a confirmed entry fill. Returns false when the order id was
    /// already applied (duplicate ack).
    #[allow(clippy::too_many_arguments)]
    pub fn on_fill(
        &mut self,
        market_id: &str,
        order_id: &str,
        side: Side,
        price: f64,
        size: f64,
        classification: Classification,
        profit_target: f64,
        level: f64,
    ) -> bool {
        let state = self.markets.entry(market_id.to_string()).or_default();
        if !state.seen_orders.insert(order_id.to_string()) {
            debug!("📦 duplicate fill ack ignored: {}", order_id);
            return false;
        }
        state.positions.push(Position {
            side,
            entry_price: price,
            size,
            entry_time: Utc::now(),
            classification,
            profit_target,
            level,
        });
        if classification == Classification::HighScalp {
            state.high_scalps_opened += 1;
        }
        info!(
            "📦 position confirmed [{}] {} {:.2}@{:.3} (target +{:.0}%) | {} open",
            classification.as_str(),
            side.as_str(),
            size,
            price,
            profit_target * 100.0,
            state.positions.len(),
        );
        true
    }

    /// Record a confirmed exit fill: removes that side's positions of the
    /// given classification. Emptying a side's LEVEL stack completes a
    /// cycle; scalp exits never do.
    pub fn on_exit_fill(
        &mut self,
        market_id: &str,
        side: Side,
        classification: Classification,
    ) -> Option<ExitOutcome> {
        let state = self.markets.get_mut(market_id)?;
        let removed: Vec<Position> = {
            let (gone, kept) = state
                .positions
                .drain(..)
                .partition(|p| p.side == side && p.classification == classification);
            state.positions = kept;
            gone
        };
        if removed.is_empty() {
            return None;
        }

        let removed_size: f64 = removed.iter().map(|p| p.size).sum();
        let removed_cost: f64 = removed.iter().map(|p| p.size * p.entry_price).sum();

        let cycle_completed = classification == Classification::Level;
        if cycle_completed {
            state.completed_cycles += 1;
            info!(
                "✓✓✓ cycle completed: #{} ({} {} closed {:.2})",
                state.completed_cycles,
                side.as_str(),
                classification.as_str(),
                removed_size,
            );
        } else {
            info!(
                "✓ exit confirmed [{}] {} {:.2} — {} open",
                classification.as_str(),
                side.as_str(),
                removed_size,
                state.positions.len(),
            );
        }

        Some(ExitOutcome {
            removed_size,
            removed_cost,
            cycle_completed,
            completed_cycles: state.completed_cycles,
        })
    }

    // ─────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────

    pub fn positions(&self, market_id: &str) -> &[Position] {
        self.markets
            .get(market_id)
            .map(|s| s.positions.as_slice())
            .unwrap_or(&[])
    }

    pub fn level_positions(&self, market_id: &str) -> Vec<&Position> {
        self.positions(market_id)
            .iter()
            .filter(|p| p.classification == Classification::Level)
            .collect()
    }

    pub fn high_scalp_positions(&self, market_id: &str, side: Side) -> Vec<&Position> {
        self.positions(market_id)
            .iter()
            .filter(|p| p.classification == Classification::HighScalp && p.side == side)
            .collect()
    }

    pub fn completed_cycles(&self, market_id: &str) -> u32 {
        self.markets
            .get(market_id)
            .map(|s| s.completed_cycles)
            .unwrap_or(0)
    }

    pub fn high_scalps_opened(&self, market_id: &str) -> u32 {
        self.markets
            .get(market_id)
            .map(|s| s.high_scalps_opened)
            .unwrap_or(0)
    }

    /// Dominant-side view with weighted average entry and unrealized PnL.
    /// The average is recomputed from positions on every call.
    pub fn summary(
        &self,
        market_id: &str,
        yes_ask: f64,
        no_ask: f64,
    ) -> Option<PositionSummary> {
        let positions = self.positions(market_id);
        if positions.is_empty() {
            return None;
        }

        let total_size: f64 = positions.iter().map(|p| p.size).sum();
        let total_cost: f64 = positions.iter().map(|p| p.size * p.entry_price).sum();
        let avg_entry = if total_size > 0.0 {
            total_cost / total_size
        } else {
            0.0
        };

        // Unwinding buys the complementary token: pnl = size·(1 − entry − exit).
        let mut unrealized = 0.0;
        for p in positions {
            let exit = match p.side {
                Side::Yes => no_ask,
                Side::No => yes_ask,
            };
            unrealized += p.size * (1.0 - p.entry_price - exit);
        }
        let pnl_pct = if total_cost > 0.0 {
            unrealized / total_cost
        } else {
            0.0
        };

        let yes_size: f64 = positions
            .iter()
            .filter(|p| p.side == Side::Yes)
            .map(|p| p.size)
            .sum();
        let no_size = total_size - yes_size;
        let side = if yes_size >= no_size { Side::Yes } else { Side::No };

        Some(PositionSummary {
            side,
            total_size,
            avg_entry,
            exit_price: match side {
                Side::Yes => no_ask,
                Side::No => yes_ask,
            },
            unrealized_pnl: unrealized,
            unrealized_pnl_pct: pnl_pct,
            num_positions: positions.len(),
        })
    }

    /// Discard every trace of a market (positions, counters, dedup set).
    pub fn remove_market(&mut self, market_id: &str) {
        self.markets.remove(market_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: &str = "market-1";

    fn fill(ledger: &mut PositionLedger, oid: &str, side: Side, price: f64, size: f64) -> bool {
        ledger.on_fill(M, oid, side, price, size, Classification::Level, 0.05, 0.34)
    }

    #[test]
    fn test_round_trip_increments_cycle_once() {
        let mut ledger = PositionLedger::new();
        assert!(fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0));
        assert_eq!(ledger.positions(M).len(), 1);

        let outcome = ledger.on_exit_fill(M, Side::Yes, Classification::Level).unwrap();
        assert!(outcome.cycle_completed);
        assert_eq!(outcome.completed_cycles, 1);
        assert!((outcome.removed_size - 10.0).abs() < 1e-9);
        assert!((outcome.removed_cost - 3.4).abs() < 1e-9);
        assert!(ledger.positions(M).is_empty());
        assert_eq!(ledger.completed_cycles(M), 1);
    }

    #[test]
    fn test_duplicate_fill_ack_is_ignored() {
        let mut ledger = PositionLedger::new();
        assert!(fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0));
        assert!(!fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0));
        assert_eq!(ledger.positions(M).len(), 1);
    }

    #[test]
    fn test_high_scalp_exit_does_not_complete_cycle() {
        let mut ledger = PositionLedger::new();
        ledger.on_fill(M, "hs1", Side::Yes, 0.88, 5.0, Classification::HighScalp, 0.02, 0.88);
        assert_eq!(ledger.high_scalps_opened(M), 1);

        let outcome = ledger
            .on_exit_fill(M, Side::Yes, Classification::HighScalp)
            .unwrap();
        assert!(!outcome.cycle_completed);
        assert_eq!(ledger.completed_cycles(M), 0);
        // Lifetime scalp count survives the exit.
        assert_eq!(ledger.high_scalps_opened(M), 1);
    }

    #[test]
    fn test_exit_fill_only_removes_matching_classification() {
        let mut ledger = PositionLedger::new();
        fill(&mut ledger, "o1", Side::Yes, 0.30, 10.0);
        ledger.on_fill(M, "hs1", Side::Yes, 0.88, 5.0, Classification::HighScalp, 0.02, 0.88);

        ledger.on_exit_fill(M, Side::Yes, Classification::Level).unwrap();
        let remaining = ledger.positions(M);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].classification, Classification::HighScalp);
    }

    #[test]
    fn test_exit_fill_without_positions_is_noop() {
        let mut ledger = PositionLedger::new();
        assert!(ledger.on_exit_fill(M, Side::No, Classification::Level).is_none());
        assert_eq!(ledger.completed_cycles(M), 0);
    }

    #[test]
    fn test_summary_weighted_average_and_pnl() {
        let mut ledger = PositionLedger::new();
        fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0);
        fill(&mut ledger, "o2", Side::Yes, 0.24, 10.0);

        // avg = (3.4 + 2.4) / 20 = 0.29; unwind at NO ask 0.62:
        // pnl = 20·(1 − 0.29 − 0.62) = 1.8
        let s = ledger.summary(M, 0.40, 0.62).unwrap();
        assert_eq!(s.side, Side::Yes);
        assert!((s.total_size - 20.0).abs() < 1e-9);
        assert!((s.avg_entry - 0.29).abs() < 1e-9);
        assert!((s.exit_price - 0.62).abs() < 1e-9);
        assert!((s.unrealized_pnl - 1.8).abs() < 1e-9);
        assert!((s.unrealized_pnl_pct - 1.8 / 5.8).abs() < 1e-9);
    }

    #[test]
    fn test_remove_market_discards_everything() {
        let mut ledger = PositionLedger::new();
        fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0);
        ledger.on_exit_fill(M, Side::Yes, Classification::Level);
        ledger.remove_market(M);
        assert_eq!(ledger.completed_cycles(M), 0);
        assert!(ledger.positions(M).is_empty());
        // Order ids are forgotten with the market.
        assert!(fill(&mut ledger, "o1", Side::Yes, 0.34, 10.0));
    }
}
