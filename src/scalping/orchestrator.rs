//! Orchestrator — the engine and its per-market workers.
//!
//! Every market gets one worker task with a single event queue: price-update
//! nudges (coalesced through a capacity-1 channel), a periodic tick, and
//! fill/control events. An evaluation may suspend on venue calls; events
//! arriving meanwhile wait in the queue and are applied only after it
//! returns, so per-market state transitions are serialized by construction.
//!
//! The strategy decides, the worker acts: it stamps debounce state on
//! emission, performs venue I/O, treats acks as provisional, and mutates
//! the ledger only on fill events (immediately, for simulated dry-run acks).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::book::BookMirror;
use super::exits::ExitCoordinator;
use super::fills::UserFeed;
use super::ledger::PositionLedger;
use super::messages::{EngineCmd, FillEvent, FillStatus, Intent, RunState, WorkerEvent};
use super::registry::MarketRegistry;
use super::strategy::{MarketView, Strategy};
use super::types::{Classification, Market, Side, Urgency};
use super::venue::{OrderSide, VenueClient, VenueError};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_markets: usize,
    /// Realized daily loss (in collateral units) that trips the kill switch.
    pub daily_loss_limit: f64,
    pub tick_interval: Duration,
    /// Kept past expiry this long before the market is discarded.
    pub grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_markets: 2,
            daily_loss_limit: 50.0,
            tick_interval: Duration::from_secs(2),
            grace: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("ENGINE_MAX_MARKETS")     { if let Ok(n) = v.parse() { c.max_concurrent_markets = n; } }
        if let Ok(v) = std::env::var("ENGINE_DAILY_LOSS_LIMIT") { if let Ok(f) = v.parse() { c.daily_loss_limit = f; } }
        if let Ok(v) = std::env::var("ENGINE_TICK_MS") {
            if let Ok(ms) = v.parse() {
                c.tick_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("ENGINE_GRACE_SECS") {
            if let Ok(s) = v.parse() {
                c.grace = Duration::from_secs(s);
            }
        }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Pending orders (ack received, fill not yet)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum PendingKind {
    Entry {
        side: Side,
        classification: Classification,
        profit_target: f64,
        level: f64,
    },
    Exit {
        side: Side,
        classification: Classification,
        /// Closed by selling the held token instead of unwinding.
        via_sell: bool,
    },
}

fn level_key(level: f64) -> u32 {
    (level * 1000.0).round() as u32
}

// ─────────────────────────────────────────────────────────
// Market worker
// ─────────────────────────────────────────────────────────

struct MarketWorker {
    market: Market,
    strategy: Arc<Strategy>,
    exits: ExitCoordinator,
    ledger: Arc<RwLock<PositionLedger>>,
    venue: Arc<VenueClient>,
    mirror: BookMirror,
    state_rx: watch::Receiver<RunState>,
    pnl_tx: mpsc::Sender<f64>,
    tick_interval: Duration,
    grace: Duration,

    pending: HashMap<String, PendingKind>,
    entry_debounce: HashMap<(Side, u32), Instant>,
    last_exit_signal: Option<Instant>,
    crossed_gate: bool,
}

impl MarketWorker {
    async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<WorkerEvent>,
        mut nudge_rx: mpsc::Receiver<()>,
    ) {
        info!(
            "🧭 worker started: {} (ends {})",
            self.market.slug, self.market.end_time,
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                ev = event_rx.recv() => match ev {
                    Some(WorkerEvent::Fill(fill)) => self.apply_fill(fill).await,
                    Some(WorkerEvent::EmergencyUnwind) => self.emergency_unwind().await,
                    Some(WorkerEvent::Shutdown) | None => break,
                },
                nudge = nudge_rx.recv() => match nudge {
                    Some(()) => self.evaluate().await,
                    None => break,
                },
                _ = ticker.tick() => self.evaluate().await,
            }

            let past_end = -self.market.time_remaining_secs(Utc::now());
            if past_end > self.grace.as_secs_f64() {
                info!("🏁 {} past grace window", self.market.slug);
                break;
            }
        }

        self.cleanup().await;
    }

    // ─────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────

    async fn evaluate(&mut self) {
        let state = *self.state_rx.borrow();
        if state == RunState::Stopped {
            return;
        }

        let now = Utc::now();
        let time_remaining = self.market.time_remaining_secs(now);
        if time_remaining <= 0.0 {
            return;
        }

        let (yes_bid, yes_ask) = self.mirror.best_prices(&self.market.token_yes).await;
        let (no_bid, no_ask) = self.mirror.best_prices(&self.market.token_no).await;

        // First tick below the gate: clear resting TP orders so a stale
        // limit cannot race the forced unwind.
        let gate_just_crossed = time_remaining
            < self.strategy.config().force_unwind_secs
            && !self.crossed_gate;
        if gate_just_crossed {
            self.crossed_gate = true;
            if self.exits.resting_count() > 0 {
                warn!(
                    "⏰ {} crossed unwind gate — cancelling {} resting TP order(s)",
                    self.market.slug,
                    self.exits.resting_count(),
                );
            }
            self.exits.cancel_all(&self.venue).await;
        }

        let view = {
            let ledger = self.ledger.read().await;
            MarketView {
                token_yes: self.market.token_yes.clone(),
                token_no: self.market.token_no.clone(),
                yes_bid,
                yes_ask,
                no_bid,
                no_ask,
                time_remaining_secs: time_remaining,
                positions: ledger.positions(&self.market.id).to_vec(),
                completed_cycles: ledger.completed_cycles(&self.market.id),
                high_scalps_opened: ledger.high_scalps_opened(&self.market.id),
                entered_levels: self
                    .entry_debounce
                    .keys()
                    .map(|(s, k)| (*s, *k as f64 / 1000.0))
                    .collect(),
                has_active_exit_orders: self.exits.blocks_entries(),
                secs_since_exit_signal: self.last_exit_signal.map(|t| t.elapsed().as_secs_f64()),
                gate_just_crossed,
            }
        };

        let Some(intent) = self.strategy.evaluate(&view) else {
            return;
        };
        if intent.is_entry() && !state.allows_entries() {
            debug!("⏸ entry suppressed while {state:?}");
            return;
        }
        self.dispatch(intent).await;
    }

    // ─────────────────────────────────────────────────
    // Intent dispatch
    // ─────────────────────────────────────────────────

    async fn dispatch(&mut self, intent: Intent) {
        match intent {
            Intent::EnterLevel {
                side,
                token_id,
                price,
                size,
                level,
                profit_target,
            } => {
                // Stamp the level before the venue call: a slow ack must not
                // let the next tick re-fire the same trigger. The stamp is
                // cleared by the side's next exit fill.
                self.entry_debounce
                    .insert((side, level_key(level)), Instant::now());
                self.place_entry(
                    side,
                    &token_id,
                    price,
                    size,
                    Classification::Level,
                    profit_target,
                    level,
                )
                .await;
            }
            Intent::EnterHighScalp {
                side,
                token_id,
                price,
                size,
                profit_target,
            } => {
                self.place_entry(
                    side,
                    &token_id,
                    price,
                    size,
                    Classification::HighScalp,
                    profit_target,
                    price,
                )
                .await;
            }
            Intent::PlaceTpLimit {
                side,
                token_id,
                price,
                size,
            } => {
                self.last_exit_signal = Some(Instant::now());
                if let Some(ack) = self
                    .exits
                    .place_or_reprice(&self.venue, &token_id, price, size)
                    .await
                {
                    self.pending.insert(
                        ack.order_id.clone(),
                        PendingKind::Exit {
                            side,
                            classification: Classification::Level,
                            via_sell: false,
                        },
                    );
                    if ack.simulated {
                        self.apply_fill(simulated_fill(&ack.order_id, &token_id, price, size))
                            .await;
                    }
                }
            }
            Intent::Exit {
                side,
                token_id,
                price,
                size,
                classification,
                urgency,
                fallback_token,
                fallback_price,
            } => {
                self.last_exit_signal = Some(Instant::now());
                if urgency == Urgency::Critical {
                    // Nothing may rest once the unwind goes out.
                    self.exits.cancel_all(&self.venue).await;
                }
                self.execute_exit(
                    side,
                    &token_id,
                    price,
                    size,
                    classification,
                    &fallback_token,
                    fallback_price,
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_entry(
        &mut self,
        side: Side,
        token_id: &str,
        price: f64,
        size: f64,
        classification: Classification,
        profit_target: f64,
        level: f64,
    ) {
        info!(
            "⚡ ENTER {} [{}] x{:.1} up to {:.3} ({})",
            side.as_str(),
            classification.as_str(),
            size,
            price,
            self.market.slug,
        );
        match self
            .venue
            .place_order(token_id, OrderSide::Buy, price, size, false)
            .await
        {
            Ok(ack) => {
                self.pending.insert(
                    ack.order_id.clone(),
                    PendingKind::Entry {
                        side,
                        classification,
                        profit_target,
                        level,
                    },
                );
                if ack.simulated {
                    self.apply_fill(simulated_fill(&ack.order_id, token_id, price, size))
                        .await;
                }
            }
            Err(e) => {
                // The level stays debounced until the side's next exit fill.
                warn!("❌ entry {} failed: {e}", side.as_str());
            }
        }
    }

    /// Close a position: unwind by buying the complementary token when
    /// collateral covers it, otherwise sell the held token.
    #[allow(clippy::too_many_arguments)]
    async fn execute_exit(
        &mut self,
        side: Side,
        token_id: &str,
        price: f64,
        size: f64,
        classification: Classification,
        fallback_token: &str,
        fallback_price: f64,
    ) {
        let balance = match self.venue.collateral_balance().await {
            Ok(b) => b,
            Err(e) => {
                warn!("❌ balance query failed: {e} — assuming empty");
                0.0
            }
        };

        let result = if balance >= size * price {
            match self
                .venue
                .place_order(token_id, OrderSide::Buy, price, size, false)
                .await
            {
                Err(VenueError::InsufficientBalance) => {
                    warn!(
                        "💸 unwind rejected for balance — selling {} at {:.3}",
                        side.as_str(),
                        fallback_price,
                    );
                    self.sell_fallback(fallback_token, fallback_price, size).await
                }
                other => other.map(|ack| (ack, false)),
            }
        } else {
            warn!(
                "💸 balance {:.2} < {:.2} — selling {} at {:.3}",
                balance,
                size * price,
                side.as_str(),
                fallback_price,
            );
            self.sell_fallback(fallback_token, fallback_price, size).await
        };

        match result {
            Ok((ack, via_sell)) => {
                self.pending.insert(
                    ack.order_id.clone(),
                    PendingKind::Exit {
                        side,
                        classification,
                        via_sell,
                    },
                );
                if ack.simulated {
                    let (asset, px) = if via_sell {
                        (fallback_token, fallback_price)
                    } else {
                        (token_id, price)
                    };
                    self.apply_fill(simulated_fill(&ack.order_id, asset, px, size))
                        .await;
                }
            }
            Err(e) => {
                // Position stays on the books; the next tick re-emits.
                warn!("❌ exit {} failed: {e}", side.as_str());
            }
        }
    }

    async fn sell_fallback(
        &self,
        token: &str,
        price: f64,
        size: f64,
    ) -> Result<(super::venue::OrderAck, bool), VenueError> {
        self.venue
            .place_order(token, OrderSide::Sell, price, size, false)
            .await
            .map(|ack| (ack, true))
    }

    // ─────────────────────────────────────────────────
    // Fill handling
    // ─────────────────────────────────────────────────

    async fn apply_fill(&mut self, fill: FillEvent) {
        if fill.status == FillStatus::Failed {
            if self.pending.remove(&fill.order_id).is_some() {
                warn!(
                    "💥 order {} failed after matching — keeping ledger unchanged",
                    fill.order_id,
                );
            }
            return;
        }

        let Some(kind) = self.pending.remove(&fill.order_id) else {
            debug!("fill for untracked order {} — ignored", fill.order_id);
            return;
        };

        match kind {
            PendingKind::Entry {
                side,
                classification,
                profit_target,
                level,
            } => {
                self.ledger.write().await.on_fill(
                    &self.market.id,
                    &fill.order_id,
                    side,
                    fill.price,
                    fill.size,
                    classification,
                    profit_target,
                    level,
                );
            }
            PendingKind::Exit {
                side,
                classification,
                via_sell,
            } => {
                let outcome = self.ledger.write().await.on_exit_fill(
                    &self.market.id,
                    side,
                    classification,
                );
                let Some(outcome) = outcome else {
                    return;
                };

                // Unwind pays 1 per pair at resolution; a sell just receives
                // the sale proceeds.
                let pnl = if via_sell {
                    outcome.removed_size * fill.price - outcome.removed_cost
                } else {
                    outcome.removed_size * (1.0 - fill.price) - outcome.removed_cost
                };
                info!(
                    "💰 {} {} closed: {:+.2} ({} cycles)",
                    self.market.slug,
                    side.as_str(),
                    pnl,
                    outcome.completed_cycles,
                );

                self.exits.on_exit_fill();
                self.entry_debounce.retain(|(s, _), _| *s != side);
                self.last_exit_signal = None;
                let _ = self.pnl_tx.send(pnl).await;
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Emergency unwind & cleanup
    // ─────────────────────────────────────────────────

    /// Close everything now: cancel resting exits, then one marketable exit
    /// per held (side, classification), with the SELL fallback when short.
    async fn emergency_unwind(&mut self) {
        warn!("🚨 emergency unwind: {}", self.market.slug);
        self.exits.cancel_all(&self.venue).await;

        let positions = self
            .ledger
            .read()
            .await
            .positions(&self.market.id)
            .to_vec();

        for classification in [Classification::Level, Classification::HighScalp] {
            for side in [Side::Yes, Side::No] {
                let held: Vec<_> = positions
                    .iter()
                    .filter(|p| p.side == side && p.classification == classification)
                    .collect();
                if held.is_empty() {
                    continue;
                }
                let size: f64 = held.iter().map(|p| p.size).sum();

                let opp_token = self.market.token(side.opposite()).to_string();
                let own_token = self.market.token(side).to_string();
                let (_, opp_ask) = self.mirror.best_prices(&opp_token).await;
                let (own_bid, _) = self.mirror.best_prices(&own_token).await;
                if opp_ask <= 0.0 && own_bid <= 0.0 {
                    warn!(
                        "❌ no prices to unwind {} {} — skipping",
                        side.as_str(),
                        classification.as_str(),
                    );
                    continue;
                }

                self.execute_exit(side, &opp_token, opp_ask, size, classification, &own_token, own_bid)
                    .await;
            }
        }
    }

    async fn cleanup(&mut self) {
        self.exits.cancel_all(&self.venue).await;
        self.ledger.write().await.remove_market(&self.market.id);
        info!("🧭 worker stopped: {}", self.market.slug);
    }
}

fn simulated_fill(order_id: &str, asset_id: &str, price: f64, size: f64) -> FillEvent {
    FillEvent {
        order_id: order_id.to_string(),
        asset_id: asset_id.to_string(),
        price,
        size,
        status: FillStatus::Confirmed,
        ts: Instant::now(),
    }
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

struct WorkerHandle {
    event_tx: mpsc::Sender<WorkerEvent>,
    nudge_tx: mpsc::Sender<()>,
    tokens: [String; 2],
    join: JoinHandle<()>,
}

pub struct Engine {
    cfg: EngineConfig,
    strategy: Arc<Strategy>,
    venue: Arc<VenueClient>,
    mirror: BookMirror,
    user_feed: Option<UserFeed>,
    ledger: Arc<RwLock<PositionLedger>>,
    registry: Arc<RwLock<MarketRegistry>>,
    state_tx: watch::Sender<RunState>,

    workers: HashMap<String, WorkerHandle>,
    token_index: HashMap<String, String>,
    pnl_tx: mpsc::Sender<f64>,
    pnl_rx: Option<mpsc::Receiver<f64>>,
    daily_pnl: f64,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        strategy: Strategy,
        venue: Arc<VenueClient>,
        mirror: BookMirror,
        user_feed: Option<UserFeed>,
        ledger: Arc<RwLock<PositionLedger>>,
        registry: Arc<RwLock<MarketRegistry>>,
        state_tx: watch::Sender<RunState>,
    ) -> Self {
        let (pnl_tx, pnl_rx) = mpsc::channel(64);
        Self {
            cfg,
            strategy: Arc::new(strategy),
            venue,
            mirror,
            user_feed,
            ledger,
            registry,
            state_tx,
            workers: HashMap::new(),
            token_index: HashMap::new(),
            pnl_tx,
            pnl_rx: Some(pnl_rx),
            daily_pnl: 0.0,
        }
    }

    /// Main event loop: control commands, book updates, fills, realized PnL.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<EngineCmd>,
        mut fill_rx: mpsc::Receiver<FillEvent>,
        mut update_rx: mpsc::Receiver<String>,
    ) {
        info!(
            "🎛️ engine started | max_markets={} loss_limit={:.0} tick={}ms",
            self.cfg.max_concurrent_markets,
            self.cfg.daily_loss_limit,
            self.cfg.tick_interval.as_millis(),
        );
        let mut pnl_rx = self.pnl_rx.take().expect("engine run() called once");
        let mut prune = tokio::time::interval(Duration::from_secs(10));
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                },
                Some(asset) = update_rx.recv() => self.nudge(&asset),
                Some(fill) = fill_rx.recv() => self.route_fill(fill).await,
                Some(pnl) = pnl_rx.recv() => self.record_pnl(pnl),
                _ = prune.tick() => self.prune().await,
            }
        }

        info!("🎛️ engine stopping — shutting down {} worker(s)", self.workers.len());
        for (_, handle) in self.workers.drain() {
            let _ = handle.event_tx.send(WorkerEvent::Shutdown).await;
            let _ = handle.join.await;
        }
    }

    async fn handle_cmd(&mut self, cmd: EngineCmd) {
        match cmd {
            EngineCmd::Start => {
                info!("▶️ start");
                let _ = self.state_tx.send(RunState::Running);
            }
            EngineCmd::Pause => {
                info!("⏸ pause (exits keep running)");
                let _ = self.state_tx.send(RunState::Paused);
            }
            EngineCmd::Stop => {
                info!("⏹ stop");
                let _ = self.state_tx.send(RunState::Stopped);
            }
            EngineCmd::AddMarket(market) => self.add_market(market).await,
            EngineCmd::RemoveMarket(id) => self.remove_market(&id).await,
            EngineCmd::EmergencyUnwind(id) => {
                match self.workers.get(&id) {
                    Some(handle) => {
                        let _ = handle.event_tx.send(WorkerEvent::EmergencyUnwind).await;
                    }
                    None => warn!("emergency unwind: unknown market {id}"),
                }
            }
        }
    }

    async fn add_market(&mut self, market: Market) {
        if self.workers.contains_key(&market.id) {
            debug!("market {} already tracked", market.slug);
            return;
        }
        if self.workers.len() >= self.cfg.max_concurrent_markets {
            debug!("market cap reached — skipping {}", market.slug);
            return;
        }
        if let Err(e) = self
            .registry
            .write()
            .await
            .register(market.clone(), Utc::now())
        {
            warn!("market rejected: {e:#}");
            return;
        }

        info!("🆕 tracking market: {} — {}", market.slug, market.question);
        let tokens = vec![market.token_yes.clone(), market.token_no.clone()];
        self.mirror.subscribe(tokens.clone()).await;
        if let Some(feed) = &self.user_feed {
            feed.watch_market(market.condition_id.clone(), tokens).await;
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        // Capacity 1: a burst of book updates collapses into one queued
        // re-evaluation.
        let (nudge_tx, nudge_rx) = mpsc::channel(1);

        let worker = MarketWorker {
            market: market.clone(),
            strategy: self.strategy.clone(),
            exits: ExitCoordinator::new(),
            ledger: self.ledger.clone(),
            venue: self.venue.clone(),
            mirror: self.mirror.clone(),
            state_rx: self.state_tx.subscribe(),
            pnl_tx: self.pnl_tx.clone(),
            tick_interval: self.cfg.tick_interval,
            grace: self.cfg.grace,
            pending: HashMap::new(),
            entry_debounce: HashMap::new(),
            last_exit_signal: None,
            crossed_gate: false,
        };
        let join = tokio::spawn(worker.run(event_rx, nudge_rx));

        self.token_index
            .insert(market.token_yes.clone(), market.id.clone());
        self.token_index
            .insert(market.token_no.clone(), market.id.clone());
        self.workers.insert(
            market.id.clone(),
            WorkerHandle {
                event_tx,
                nudge_tx,
                tokens: [market.token_yes, market.token_no],
                join,
            },
        );
    }

    async fn remove_market(&mut self, market_id: &str) {
        let Some(handle) = self.workers.remove(market_id) else {
            warn!("remove: unknown market {market_id}");
            return;
        };
        for token in &handle.tokens {
            self.token_index.remove(token);
        }
        self.registry.write().await.remove(market_id);
        let _ = handle.event_tx.send(WorkerEvent::Shutdown).await;
        let _ = handle.join.await;
    }

    fn nudge(&self, asset_id: &str) {
        if let Some(market_id) = self.token_index.get(asset_id) {
            if let Some(handle) = self.workers.get(market_id) {
                // Full queue means an evaluation is already pending.
                let _ = handle.nudge_tx.try_send(());
            }
        }
    }

    async fn route_fill(&mut self, fill: FillEvent) {
        match self.token_index.get(&fill.asset_id) {
            Some(market_id) => {
                if let Some(handle) = self.workers.get(market_id) {
                    let _ = handle.event_tx.send(WorkerEvent::Fill(fill)).await;
                }
            }
            None => debug!("fill for untracked asset {} — dropped", fill.asset_id),
        }
    }

    fn record_pnl(&mut self, pnl: f64) {
        self.daily_pnl += pnl;
        info!("📊 realized today: {:+.2}", self.daily_pnl);
        if self.daily_pnl <= -self.cfg.daily_loss_limit
            && *self.state_tx.borrow() != RunState::Killed
        {
            warn!(
                "☠️ DAILY LOSS LIMIT REACHED ({:.2}) — entries disabled, exits continue",
                self.daily_pnl,
            );
            let _ = self.state_tx.send(RunState::Killed);
        }
    }

    async fn prune(&mut self) {
        let removed = self.registry.write().await.prune(Utc::now());
        for market in removed {
            info!("🧹 pruning expired market {}", market.slug);
            if let Some(handle) = self.workers.remove(&market.id) {
                for token in &handle.tokens {
                    self.token_index.remove(token);
                }
                let _ = handle.event_tx.send(WorkerEvent::Shutdown).await;
                let _ = handle.join.await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalping::book::OrderBook;
    use crate::scalping::strategy::StrategyConfig;
    use chrono::TimeDelta;

    fn market(secs_to_end: i64) -> Market {
        Market {
            id: "m1".into(),
            condition_id: "cond-1".into(),
            slug: "btc-updown-15m-test".into(),
            question: "Bitcoin Up or Down?".into(),
            end_time: Utc::now() + TimeDelta::seconds(secs_to_end),
            token_yes: "tok-yes".into(),
            token_no: "tok-no".into(),
        }
    }

    struct Rig {
        worker: MarketWorker,
        books: Arc<RwLock<HashMap<String, OrderBook>>>,
        pnl_rx: mpsc::Receiver<f64>,
        _state_tx: watch::Sender<RunState>,
    }

    async fn rig(secs_to_end: i64) -> Rig {
        let (mirror, books) = BookMirror::seeded();
        {
            let mut map = books.write().await;
            map.insert("tok-yes".into(), OrderBook::new());
            map.insert("tok-no".into(), OrderBook::new());
        }
        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let (pnl_tx, pnl_rx) = mpsc::channel(16);
        let worker = MarketWorker {
            market: market(secs_to_end),
            strategy: Arc::new(Strategy::new(StrategyConfig::default())),
            exits: ExitCoordinator::new(),
            ledger: Arc::new(RwLock::new(PositionLedger::new())),
            venue: Arc::new(VenueClient::new("https://clob.example", None, false)),
            mirror,
            state_rx,
            pnl_tx,
            tick_interval: Duration::from_secs(2),
            grace: Duration::from_secs(600),
            pending: HashMap::new(),
            entry_debounce: HashMap::new(),
            last_exit_signal: None,
            crossed_gate: false,
        };
        Rig {
            worker,
            books,
            pnl_rx,
            _state_tx: state_tx,
        }
    }

    async fn set_prices(rig: &Rig, token: &str, bid: f64, ask: f64) {
        let mut map = rig.books.write().await;
        let book = map.get_mut(token).unwrap();
        book.apply_snapshot(&[(bid, 10.0)], &[(ask, 10.0)]);
    }

    #[tokio::test]
    async fn test_dry_run_level_round_trip() {
        let mut r = rig(720).await;
        set_prices(&r, "tok-yes", 0.30, 0.33).await;
        set_prices(&r, "tok-no", 0.60, 0.66).await;

        // Entry: YES below 0.34 → simulated ack → immediate fill.
        r.worker.evaluate().await;
        {
            let ledger = r.worker.ledger.read().await;
            let positions = ledger.positions("m1");
            assert_eq!(positions.len(), 1);
            assert_eq!(positions[0].side, Side::Yes);
            assert!((positions[0].size - 10.0).abs() < 1e-9);
        }
        assert!(r.worker.entry_debounce.contains_key(&(Side::Yes, 340)));

        // The simulated entry filled at the 0.34 trigger, so the TP target
        // is 1 − 1.05·0.34 = 0.643: at NO ask 0.62 the worker rests the TP,
        // and the simulated ack fills it straight away, closing the cycle.
        set_prices(&r, "tok-no", 0.55, 0.62).await;
        r.worker.last_exit_signal = None;
        r.worker.evaluate().await;
        {
            let ledger = r.worker.ledger.read().await;
            assert!(ledger.positions("m1").is_empty());
            assert_eq!(ledger.completed_cycles("m1"), 1);
        }
        // Exit fill cleared the grid debounce and the exit-order set.
        assert!(r.worker.entry_debounce.is_empty());
        assert!(!r.worker.exits.blocks_entries());
        let pnl = r.pnl_rx.recv().await.unwrap();
        // 10·(1 − 0.34 − 0.62) = 0.40
        assert!((pnl - 0.40).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_forced_unwind_below_gate() {
        let mut r = rig(240).await;
        set_prices(&r, "tok-yes", 0.41, 0.45).await;
        set_prices(&r, "tok-no", 0.52, 0.58).await;
        r.worker.ledger.write().await.on_fill(
            "m1",
            "entry-1",
            Side::Yes,
            0.34,
            10.0,
            Classification::Level,
            0.05,
            0.34,
        );

        r.worker.evaluate().await;
        assert!(r.worker.crossed_gate);
        {
            let ledger = r.worker.ledger.read().await;
            assert!(ledger.positions("m1").is_empty());
            assert_eq!(ledger.completed_cycles("m1"), 1);
        }
        // Unwound at NO ask 0.58: 10·(1 − 0.34 − 0.58) = 0.80
        let pnl = r.pnl_rx.recv().await.unwrap();
        assert!((pnl - 0.80).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_high_scalp_admission_and_exit() {
        let mut r = rig(180).await;
        set_prices(&r, "tok-yes", 0.86, 0.88).await;
        set_prices(&r, "tok-no", 0.10, 0.13).await;

        r.worker.evaluate().await;
        {
            let ledger = r.worker.ledger.read().await;
            assert_eq!(ledger.high_scalp_positions("m1", Side::Yes).len(), 1);
            assert_eq!(ledger.high_scalps_opened("m1"), 1);
        }

        // Target exit 1 − 1.02·0.88 = 0.1024; NO ask drops to 0.10.
        set_prices(&r, "tok-no", 0.08, 0.10).await;
        r.worker.last_exit_signal = None;
        r.worker.evaluate().await;
        {
            let ledger = r.worker.ledger.read().await;
            assert!(ledger.positions("m1").is_empty());
            // Scalp exits never count as grid cycles.
            assert_eq!(ledger.completed_cycles("m1"), 0);
            assert_eq!(ledger.high_scalps_opened("m1"), 1);
        }
    }

    #[tokio::test]
    async fn test_untracked_fill_is_ignored() {
        let mut r = rig(720).await;
        r.worker
            .apply_fill(simulated_fill("phantom", "tok-yes", 0.33, 10.0))
            .await;
        assert!(r.worker.ledger.read().await.positions("m1").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fill_does_not_duplicate_position() {
        let mut r = rig(720).await;
        r.worker.pending.insert(
            "o-1".into(),
            PendingKind::Entry {
                side: Side::Yes,
                classification: Classification::Level,
                profit_target: 0.05,
                level: 0.34,
            },
        );
        let fill = simulated_fill("o-1", "tok-yes", 0.33, 10.0);
        r.worker.apply_fill(fill.clone()).await;
        r.worker.apply_fill(fill).await; // pending gone: ignored
        assert_eq!(r.worker.ledger.read().await.positions("m1").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fill_leaves_ledger_unchanged() {
        let mut r = rig(720).await;
        r.worker.pending.insert(
            "o-1".into(),
            PendingKind::Entry {
                side: Side::Yes,
                classification: Classification::Level,
                profit_target: 0.05,
                level: 0.34,
            },
        );
        let mut fill = simulated_fill("o-1", "tok-yes", 0.33, 10.0);
        fill.status = FillStatus::Failed;
        r.worker.apply_fill(fill).await;
        assert!(r.worker.ledger.read().await.positions("m1").is_empty());
        assert!(r.worker.pending.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_unwind_closes_everything() {
        let mut r = rig(720).await;
        set_prices(&r, "tok-yes", 0.30, 0.35).await;
        set_prices(&r, "tok-no", 0.60, 0.66).await;
        {
            let mut ledger = r.worker.ledger.write().await;
            ledger.on_fill("m1", "e1", Side::Yes, 0.34, 10.0, Classification::Level, 0.05, 0.34);
            ledger.on_fill("m1", "e2", Side::Yes, 0.88, 5.0, Classification::HighScalp, 0.02, 0.88);
        }

        r.worker.emergency_unwind().await;
        assert!(r.worker.ledger.read().await.positions("m1").is_empty());
    }

    #[tokio::test]
    async fn test_stopped_state_suppresses_evaluation() {
        let mut r = rig(720).await;
        set_prices(&r, "tok-yes", 0.30, 0.33).await;
        set_prices(&r, "tok-no", 0.60, 0.66).await;
        r._state_tx.send(RunState::Stopped).unwrap();
        r.worker.evaluate().await;
        assert!(r.worker.ledger.read().await.positions("m1").is_empty());
    }

    #[tokio::test]
    async fn test_paused_state_blocks_entries() {
        let mut r = rig(720).await;
        set_prices(&r, "tok-yes", 0.30, 0.33).await;
        set_prices(&r, "tok-no", 0.60, 0.66).await;
        r._state_tx.send(RunState::Paused).unwrap();
        r.worker.evaluate().await;
        assert!(r.worker.ledger.read().await.positions("m1").is_empty());
        assert!(r.worker.entry_debounce.is_empty());
    }
}
