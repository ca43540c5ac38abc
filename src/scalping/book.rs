//! Order-book mirror — per-token best bid/ask derived from the streaming
//! market feed.
//!
//! One reader task owns the WebSocket session: handshake, subscriptions,
//! reconnect with exponential backoff, and a message-arrival health monitor
//! (the feed answers no pings; silence is the only failure signal).
//! Consumers read best prices through the shared handle and receive a
//! token id on an update channel after every applied change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

// Price levels are keyed in 0.1-cent ticks so the sides stay ordered.
const PRICE_SCALE: f64 = 1000.0;

// Books older than this read as empty: a dead feed must not keep feeding
// the strategy prices that are no longer real.
const STALE_AFTER: Duration = Duration::from_secs(120);

fn price_key(price: f64) -> Option<u32> {
    if !(price > 0.0 && price <= 1.0) {
        return None;
    }
    Some((price * PRICE_SCALE).round() as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// One token's book: two price→size maps plus the last update wall time.
/// Best bid/ask are the map extremes; `0.0` is the empty-side sentinel.
#[derive(Debug)]
pub struct OrderBook {
    bids: BTreeMap<u32, f64>,
    asks: BTreeMap<u32, f64>,
    pub updated_at: Instant,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            updated_at: Instant::now(),
        }
    }

    pub fn best_bid(&self) -> f64 {
        self.bids
            .last_key_value()
            .map(|(k, _)| *k as f64 / PRICE_SCALE)
            .unwrap_or(0.0)
    }

    pub fn best_ask(&self) -> f64 {
        self.asks
            .first_key_value()
            .map(|(k, _)| *k as f64 / PRICE_SCALE)
            .unwrap_or(0.0)
    }

    /// Replace both sides from a full snapshot.
    pub fn apply_snapshot(&mut self, bids: &[(f64, f64)], asks: &[(f64, f64)]) {
        self.bids.clear();
        self.asks.clear();
        for &(p, s) in bids {
            self.apply_level(BookSide::Bid, p, s);
        }
        for &(p, s) in asks {
            self.apply_level(BookSide::Ask, p, s);
        }
        self.updated_at = Instant::now();
    }

    /// Apply one incremental level change. Size 0 deletes the level;
    /// deleting a level that does not exist is a no-op.
    pub fn apply_level(&mut self, side: BookSide, price: f64, size: f64) {
        let Some(key) = price_key(price) else {
            return;
        };
        let map = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };
        if size <= 0.0 {
            map.remove(&key);
        } else {
            map.insert(key, size);
        }
        self.updated_at = Instant::now();
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────
// Mirror actor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub ws_url: String,
    /// Warn when no message has arrived for this long.
    pub warn_after: Duration,
    /// Declare the connection dead and reconnect after this long.
    pub dead_after: Duration,
    pub connect_timeout: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".into(),
            warn_after: Duration::from_secs(60),
            dead_after: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum MirrorCmd {
    Subscribe(Vec<String>),
}

/// Shared handle to the mirror. Cheap to clone.
#[derive(Clone)]
pub struct BookMirror {
    cmd_tx: mpsc::Sender<MirrorCmd>,
    books: Arc<RwLock<HashMap<String, OrderBook>>>,
}

impl BookMirror {
    /// Spawn the reader task. `update_tx` receives the asset id after every
    /// applied book change.
    pub fn spawn(
        cfg: MirrorConfig,
        update_tx: mpsc::Sender<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let books: Arc<RwLock<HashMap<String, OrderBook>>> = Arc::new(RwLock::new(HashMap::new()));
        let worker_books = books.clone();
        tokio::spawn(run_mirror(cfg, worker_books, cmd_rx, update_tx, shutdown));
        Self { cmd_tx, books }
    }

    /// Register tokens with the mirror. Idempotent; updates for tokens that
    /// were never subscribed are dropped by the reader.
    pub async fn subscribe(&self, tokens: Vec<String>) {
        {
            let mut books = self.books.write().await;
            for t in &tokens {
                books.entry(t.clone()).or_default();
            }
        }
        let _ = self.cmd_tx.send(MirrorCmd::Subscribe(tokens)).await;
    }

    /// Current (best bid, best ask) for a token; (0, 0) when unknown,
    /// empty, or stale.
    pub async fn best_prices(&self, token: &str) -> (f64, f64) {
        let books = self.books.read().await;
        books
            .get(token)
            .filter(|b| b.updated_at.elapsed() < STALE_AFTER)
            .map(|b| (b.best_bid(), b.best_ask()))
            .unwrap_or((0.0, 0.0))
    }

    /// Mirror with no reader task, fed directly by tests.
    #[cfg(test)]
    pub(crate) fn seeded() -> (Self, Arc<RwLock<HashMap<String, OrderBook>>>) {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let books: Arc<RwLock<HashMap<String, OrderBook>>> = Arc::new(RwLock::new(HashMap::new()));
        (
            Self {
                cmd_tx,
                books: books.clone(),
            },
            books,
        )
    }
}

async fn run_mirror(
    cfg: MirrorConfig,
    books: Arc<RwLock<HashMap<String, OrderBook>>>,
    mut cmd_rx: mpsc::Receiver<MirrorCmd>,
    update_tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        // Need at least one token before a session is worth opening.
        while subscribed.is_empty() {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(MirrorCmd::Subscribe(tokens)) => subscribed.extend(tokens),
                    None => return,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }

        match run_session(
            &cfg,
            &books,
            &mut cmd_rx,
            &update_tx,
            &mut subscribed,
            &mut shutdown,
        )
        .await
        {
            Ok(()) => return, // shutdown requested
            Err(e) => warn!("📡 market feed session ended: {e:#}"),
        }

        // 2, 4, 8, … capped at 30s, with a little jitter to avoid
        // reconnect stampedes.
        attempt += 1;
        let backoff = 2u64.saturating_pow(attempt.min(5)).min(30);
        let jitter = rand::thread_rng().gen_range(0..500);
        let delay = Duration::from_secs(backoff) + Duration::from_millis(jitter);
        info!("📡 reconnecting market feed in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }
    }
}

async fn run_session(
    cfg: &MirrorConfig,
    books: &Arc<RwLock<HashMap<String, OrderBook>>>,
    cmd_rx: &mut mpsc::Receiver<MirrorCmd>,
    update_tx: &mpsc::Sender<String>,
    subscribed: &mut HashSet<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!(url = %cfg.ws_url, "📡 connecting market feed");

    let connect = tokio::time::timeout(cfg.connect_timeout, connect_async(&cfg.ws_url)).await;
    let (ws, response) = match connect {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => anyhow::bail!("connect error: {e}"),
        Err(_) => anyhow::bail!("connect timeout"),
    };
    info!("✅ market feed connected (status={:?})", response.status());
    let (mut write, mut read) = ws.split();

    // The feed requires a handshake before any subscription is honored.
    let handshake = json!({ "assets_ids": [], "type": "market" });
    write.send(Message::Text(handshake.to_string())).await?;

    // Replay the full subscription set after every (re)connect.
    let assets: Vec<&String> = subscribed.iter().collect();
    let sub = json!({ "operation": "subscribe", "assets_ids": assets });
    write.send(Message::Text(sub.to_string())).await?;
    info!("📤 subscribed {} tokens", subscribed.len());

    let mut last_msg = Instant::now();
    let mut warned = false;
    let mut health = tokio::time::interval(Duration::from_secs(20));
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_msg = Instant::now();
                        warned = false;
                        let touched = {
                            let mut books = books.write().await;
                            apply_stream_text(&mut books, &text)
                        };
                        for asset in touched {
                            let _ = update_tx.send(asset).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) => anyhow::bail!("closed by server"),
                    Some(Err(e)) => anyhow::bail!("read error: {e}"),
                    None => anyhow::bail!("stream ended"),
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(MirrorCmd::Subscribe(tokens)) => {
                        let fresh: Vec<String> = tokens
                            .into_iter()
                            .filter(|t| subscribed.insert(t.clone()))
                            .collect();
                        if !fresh.is_empty() {
                            let sub = json!({ "operation": "subscribe", "assets_ids": fresh });
                            write.send(Message::Text(sub.to_string())).await?;
                            debug!("📤 dynamic subscribe sent");
                        }
                    }
                    None => return Ok(()),
                }
            }
            _ = health.tick() => {
                let silent = last_msg.elapsed();
                if silent >= cfg.dead_after {
                    anyhow::bail!("no messages for {:.0}s", silent.as_secs_f64());
                }
                if silent >= cfg.warn_after && !warned {
                    warn!("⚠️ market feed silent for {:.0}s", silent.as_secs_f64());
                    warned = true;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("📡 market feed shutting down");
                    return Ok(());
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Message parsing
// ─────────────────────────────────────────────────────────

/// Apply one raw text frame. Malformed JSON is logged and dropped;
/// updates for untracked tokens are ignored. Returns the touched asset ids.
fn apply_stream_text(books: &mut HashMap<String, OrderBook>, text: &str) -> Vec<String> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            if !text.trim().is_empty() {
                warn!("📡 dropping malformed feed line: {e}");
            }
            return Vec::new();
        }
    };

    let items = match &value {
        Value::Array(items) => items.as_slice(),
        _ => std::slice::from_ref(&value),
    };

    let mut touched = Vec::new();
    for item in items {
        touched.extend(apply_stream_item(books, item));
    }
    touched
}

fn apply_stream_item(books: &mut HashMap<String, OrderBook>, item: &Value) -> Vec<String> {
    let mut touched = Vec::new();

    // Full snapshot: {asset_id, bids: [{price, size}…], asks: […]}
    if let Some(asset_id) = item.get("asset_id").and_then(|v| v.as_str()) {
        if item.get("bids").is_some() || item.get("asks").is_some() {
            if let Some(book) = books.get_mut(asset_id) {
                let bids = parse_levels(item.get("bids"));
                let asks = parse_levels(item.get("asks"));
                book.apply_snapshot(&bids, &asks);
                touched.push(asset_id.to_string());
            }
        }
    }

    // Incremental: {price_changes: [{asset_id, side: BUY|SELL, price, size}…]}
    if let Some(changes) = item.get("price_changes").and_then(|v| v.as_array()) {
        for ch in changes {
            let Some(asset_id) = ch.get("asset_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(book) = books.get_mut(asset_id) else {
                continue;
            };
            let side = match ch.get("side").and_then(|v| v.as_str()) {
                Some(s) if s.eq_ignore_ascii_case("BUY") => BookSide::Bid,
                Some(s) if s.eq_ignore_ascii_case("SELL") => BookSide::Ask,
                _ => continue,
            };
            let Some(price) = parse_f64_field(ch, "price") else {
                continue;
            };
            let size = parse_f64_field(ch, "size").unwrap_or(0.0);
            book.apply_level(side, price, size);
            if !touched.iter().any(|t| t == asset_id) {
                touched.push(asset_id.to_string());
            }
        }
    }

    touched
}

fn parse_levels(value: Option<&Value>) -> Vec<(f64, f64)> {
    value
        .and_then(|v| v.as_array())
        .map(|levels| {
            levels
                .iter()
                .filter_map(|lvl| {
                    let p = parse_f64_field(lvl, "price")?;
                    let s = parse_f64_field(lvl, "size")?;
                    Some((p, s))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a JSON field as f64, handling both string ("0.50") and number forms.
fn parse_f64_field(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_prices_from_snapshot() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&[(0.30, 10.0), (0.33, 5.0)], &[(0.36, 8.0), (0.34, 2.0)]);
        assert!((book.best_bid() - 0.33).abs() < 1e-9);
        assert!((book.best_ask() - 0.34).abs() < 1e-9);
    }

    #[test]
    fn test_empty_sides_report_sentinel() {
        let book = OrderBook::new();
        assert_eq!(book.best_bid(), 0.0);
        assert_eq!(book.best_ask(), 0.0);
    }

    #[test]
    fn test_size_zero_removes_level() {
        let mut book = OrderBook::new();
        book.apply_level(BookSide::Ask, 0.34, 2.0);
        book.apply_level(BookSide::Ask, 0.36, 4.0);
        book.apply_level(BookSide::Ask, 0.34, 0.0);
        assert!((book.best_ask() - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_size_zero_on_missing_level_is_noop() {
        let mut book = OrderBook::new();
        book.apply_level(BookSide::Bid, 0.50, 0.0);
        assert_eq!(book.best_bid(), 0.0);
    }

    #[test]
    fn test_snapshot_replaces_previous_levels() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&[(0.40, 1.0)], &[(0.60, 1.0)]);
        book.apply_snapshot(&[(0.20, 1.0)], &[(0.80, 1.0)]);
        assert!((book.best_bid() - 0.20).abs() < 1e-9);
        assert!((book.best_ask() - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_stream_snapshot_then_delta() {
        let mut books = HashMap::new();
        books.insert("tok".to_string(), OrderBook::new());

        let snap = r#"[{"asset_id":"tok","bids":[{"price":"0.30","size":"10"}],"asks":[{"price":"0.36","size":"8"}]}]"#;
        let touched = apply_stream_text(&mut books, snap);
        assert_eq!(touched, vec!["tok".to_string()]);

        let delta =
            r#"{"price_changes":[{"asset_id":"tok","side":"SELL","price":"0.34","size":"3"}]}"#;
        apply_stream_text(&mut books, delta);
        assert!((books["tok"].best_ask() - 0.34).abs() < 1e-9);
        assert!((books["tok"].best_bid() - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_token_is_ignored() {
        let mut books = HashMap::new();
        let snap = r#"{"asset_id":"stranger","bids":[{"price":"0.5","size":"1"}],"asks":[]}"#;
        let touched = apply_stream_text(&mut books, snap);
        assert!(touched.is_empty());
        assert!(books.is_empty());
    }

    #[test]
    fn test_malformed_line_is_dropped() {
        let mut books = HashMap::new();
        books.insert("tok".to_string(), OrderBook::new());
        let touched = apply_stream_text(&mut books, "{not json");
        assert!(touched.is_empty());
    }
}
