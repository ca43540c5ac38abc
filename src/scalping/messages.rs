//! Channel message types for the scalping actor architecture.
//!
//! The strategy is a pure function that returns at most one `Intent` per
//! evaluation; all I/O happens in the orchestrator after it returns.
//! Fills come exclusively from the exchange (user feed or simulated acks),
//! never from order placement itself.

use std::time::Instant;

use super::types::{Classification, Market, Side, Urgency};

// ─────────────────────────────────────────────────────────
// Strategy output (Strategy → Orchestrator)
// ─────────────────────────────────────────────────────────

/// One action the strategy wants taken on a market.
///
/// `token_id` is always the token to BUY: the entered side's token for
/// entries, the complementary token for exits (unwinding a YES position
/// means buying NO — the 1-payoff pair locks in value). Exits carry the
/// held side's token and bid as the SELL fallback for when collateral
/// cannot cover the unwind.
#[derive(Debug, Clone)]
pub enum Intent {
    /// Open or scale a grid position with a marketable buy.
    EnterLevel {
        side: Side,
        token_id: String,
        /// Grid trigger price. The marketable buy executes at or below it.
        price: f64,
        size: f64,
        level: f64,
        profit_target: f64,
    },
    /// Late-window entry on the side priced at or above the scalp threshold.
    EnterHighScalp {
        side: Side,
        token_id: String,
        price: f64,
        size: f64,
        profit_target: f64,
    },
    /// Rest a post-only take-profit order on the complementary token.
    PlaceTpLimit {
        /// Side of the held position being unwound.
        side: Side,
        token_id: String,
        price: f64,
        size: f64,
    },
    /// Close immediately with a marketable buy of the complementary token.
    Exit {
        side: Side,
        token_id: String,
        price: f64,
        size: f64,
        classification: Classification,
        urgency: Urgency,
        /// Held token to SELL when the unwind buy cannot be funded.
        fallback_token: String,
        fallback_price: f64,
    },
}

impl Intent {
    pub fn is_entry(&self) -> bool {
        matches!(self, Intent::EnterLevel { .. } | Intent::EnterHighScalp { .. })
    }

    pub fn is_exit_class(&self) -> bool {
        matches!(self, Intent::PlaceTpLimit { .. } | Intent::Exit { .. })
    }
}

// ─────────────────────────────────────────────────────────
// Fill events (User feed → Orchestrator → Ledger)
// ─────────────────────────────────────────────────────────

/// Fill status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// Matched on the book, not yet settled.
    Matched,
    /// Settled / confirmed.
    Confirmed,
    /// Failed after matching; the ledger must not change.
    Failed,
}

/// A real trade fill. The single source of truth for position changes.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: String,
    pub asset_id: String,
    pub price: f64,
    pub size: f64,
    pub status: FillStatus,
    pub ts: Instant,
}

// ─────────────────────────────────────────────────────────
// Engine control surface
// ─────────────────────────────────────────────────────────

/// Commands accepted by the engine (control API / CLI).
#[derive(Debug, Clone)]
pub enum EngineCmd {
    Start,
    Stop,
    Pause,
    AddMarket(Market),
    RemoveMarket(String),
    /// Cancel every exit order for the market, then close every open
    /// position at market, selling the held token when cash is short.
    EmergencyUnwind(String),
}

/// Process-wide run state, broadcast to every market worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    /// Entries blocked, exit logic keeps running.
    Paused,
    /// Daily loss limit tripped: entries blocked until restart.
    Killed,
    /// No evaluation at all.
    Stopped,
}

impl RunState {
    pub fn allows_entries(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

// ─────────────────────────────────────────────────────────
// Per-market worker events
// ─────────────────────────────────────────────────────────

/// Events delivered to a market worker's queue. The queue is the market's
/// serialization point: events arriving while an evaluation is in flight
/// are applied only after it returns.
#[derive(Debug)]
pub enum WorkerEvent {
    Fill(FillEvent),
    EmergencyUnwind,
    Shutdown,
}
