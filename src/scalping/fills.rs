//! Authenticated user feed — real fill events for our orders.
//!
//! Order placement acks are provisional; this stream is what actually moves
//! the position ledger. Trade events arrive on the authenticated `/user`
//! WebSocket channel; a TTL'd dedup cache is kept across reconnects so
//! replayed events are never double-counted.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::messages::{FillEvent, FillStatus};

#[derive(Debug, Clone)]
pub struct UserFeedConfig {
    /// Base WS url; the user channel path is appended.
    pub ws_base_url: String,
    pub api_key: String,
    pub api_secret: SecretString,
    pub api_passphrase: SecretString,
}

#[derive(Debug)]
enum FeedCmd {
    /// Track a market's trades. Forces a resubscribing reconnect.
    Watch {
        market_id: String,
        asset_ids: Vec<String>,
    },
}

#[derive(Clone)]
pub struct UserFeed {
    cmd_tx: mpsc::Sender<FeedCmd>,
}

impl UserFeed {
    pub fn spawn(
        cfg: UserFeedConfig,
        fill_tx: mpsc::Sender<FillEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        tokio::spawn(run_feed(cfg, cmd_rx, fill_tx, shutdown));
        Self { cmd_tx }
    }

    pub async fn watch_market(&self, market_id: String, asset_ids: Vec<String>) {
        let _ = self.cmd_tx.send(FeedCmd::Watch { market_id, asset_ids }).await;
    }
}

// ─────────────────────────────────────────────────────────
// Dedup cache (kept across reconnects)
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct DedupCache {
    seen_at: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen_at: HashMap::with_capacity(max_entries.min(4096)),
            ttl,
            max_entries,
        }
    }

    /// Returns true the first time a key is seen within the TTL window.
    fn remember(&mut self, key: String) -> bool {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.ttl).unwrap_or(now);
        self.seen_at.retain(|_, ts| *ts >= cutoff);

        if self.seen_at.contains_key(&key) {
            return false;
        }
        self.seen_at.insert(key, now);
        while self.seen_at.len() > self.max_entries {
            let oldest = self
                .seen_at
                .iter()
                .min_by_key(|(_, ts)| *ts)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.seen_at.remove(&k);
                }
                None => break,
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────
// Feed loop
// ─────────────────────────────────────────────────────────

async fn run_feed(
    cfg: UserFeedConfig,
    mut cmd_rx: mpsc::Receiver<FeedCmd>,
    fill_tx: mpsc::Sender<FillEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("👤 user feed started");
    let mut markets: HashSet<String> = HashSet::new();
    let mut assets: HashSet<String> = HashSet::new();
    // 15 min TTL covers typical reconnect replay windows.
    let mut dedup = DedupCache::new(Duration::from_secs(15 * 60), 50_000);

    loop {
        if *shutdown.borrow() {
            return;
        }

        while markets.is_empty() {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(FeedCmd::Watch { market_id, asset_ids }) => {
                        markets.insert(market_id);
                        assets.extend(asset_ids);
                    }
                    None => return,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }

        match run_session(
            &cfg,
            &mut cmd_rx,
            &fill_tx,
            &mut markets,
            &mut assets,
            &mut dedup,
            &mut shutdown,
        )
        .await
        {
            SessionEnd::Shutdown => return,
            SessionEnd::Resubscribe => {
                debug!("👤 reconnecting user feed with updated subscriptions");
            }
            SessionEnd::Error(e) => {
                warn!("👤 user feed session ended: {e}");
                tokio::select! {
                    _ = sleep(Duration::from_secs(3)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() { return; }
                    }
                }
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Resubscribe,
    Error(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    cfg: &UserFeedConfig,
    cmd_rx: &mut mpsc::Receiver<FeedCmd>,
    fill_tx: &mpsc::Sender<FillEvent>,
    markets: &mut HashSet<String>,
    assets: &mut HashSet<String>,
    dedup: &mut DedupCache,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let url = format!("{}/user", cfg.ws_base_url.trim_end_matches('/'));
    info!(%url, "👤 connecting user feed");

    let connect = tokio::time::timeout(Duration::from_secs(10), connect_async(&url)).await;
    let (ws, _) = match connect {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return SessionEnd::Error(format!("connect error: {e}")),
        Err(_) => return SessionEnd::Error("connect timeout".into()),
    };
    let (mut write, mut read) = ws.split();

    // The channel only delivers trade events for explicitly listed
    // markets/assets.
    let subscribe = json!({
        "type": "user",
        "operation": "subscribe",
        "markets": markets.iter().collect::<Vec<_>>(),
        "assets_ids": assets.iter().collect::<Vec<_>>(),
        "auth": {
            "apiKey": cfg.api_key,
            "secret": cfg.api_secret.expose_secret(),
            "passphrase": cfg.api_passphrase.expose_secret(),
        },
    });
    if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
        return SessionEnd::Error(format!("subscribe failed: {e}"));
    }
    info!("👤 user feed subscribed ({} markets)", markets.len());

    let mut keepalive = tokio::time::interval(Duration::from_secs(10));

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            continue;
                        };
                        let items = match value {
                            Value::Array(items) => items,
                            other => vec![other],
                        };
                        for item in &items {
                            for fill in parse_trade_event(item, &cfg.api_key, dedup) {
                                info!(
                                    "🔔 FILL {} {:.2}@{:.3} status={:?} id={}",
                                    &fill.asset_id[..8.min(fill.asset_id.len())],
                                    fill.size,
                                    fill.price,
                                    fill.status,
                                    &fill.order_id[..8.min(fill.order_id.len())],
                                );
                                let _ = fill_tx.send(fill).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Error("closed by server".into()),
                    Some(Err(e)) => return SessionEnd::Error(format!("read error: {e}")),
                    None => return SessionEnd::Error("stream ended".into()),
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(FeedCmd::Watch { market_id, asset_ids }) => {
                        let fresh = markets.insert(market_id);
                        assets.extend(asset_ids);
                        if fresh {
                            return SessionEnd::Resubscribe;
                        }
                    }
                    None => return SessionEnd::Shutdown,
                }
            }
            _ = keepalive.tick() => {
                if write.send(Message::Text("PING".to_string())).await.is_err() {
                    return SessionEnd::Error("keepalive send failed".into());
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Trade event parsing
// ─────────────────────────────────────────────────────────

/// Parse one trade event into fill(s).
///
/// Maker-first: when we rested the order, the real fill data lives in
/// `maker_orders[]` (filtered to entries we own), not the top-level fields.
/// A single taker trade can match several of our maker orders, hence Vec.
fn parse_trade_event(val: &Value, our_api_key: &str, dedup: &mut DedupCache) -> Vec<FillEvent> {
    let event_type = val
        .get("event_type")
        .or_else(|| val.get("type"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !event_type.eq_ignore_ascii_case("trade") {
        return Vec::new();
    }

    let status = match val.get("status").and_then(|v| v.as_str()).unwrap_or("") {
        "MATCHED" => FillStatus::Matched,
        "MINED" | "CONFIRMED" => FillStatus::Confirmed,
        "FAILED" => FillStatus::Failed,
        other => {
            // RETRYING is transient; anything else is not a fill.
            debug!("👤 ignoring trade status {other:?}");
            return Vec::new();
        }
    };

    let trade_id = val.get("id").and_then(|v| v.as_str()).unwrap_or_default();
    let trader_side = val
        .get("trader_side")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let maker_orders = val.get("maker_orders").and_then(|v| v.as_array());

    if trader_side.eq_ignore_ascii_case("MAKER")
        || (trader_side.is_empty() && maker_orders.is_some_and(|a| !a.is_empty()))
    {
        let mut fills = Vec::new();
        let our_key = our_api_key.trim().to_lowercase();
        for mo in maker_orders.into_iter().flatten() {
            let owner = mo
                .get("owner")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if owner != our_key {
                continue;
            }
            let Some(fill) = extract_fill(mo, status) else {
                continue;
            };
            let key = dedup_key(trade_id, &fill);
            if dedup.remember(key) {
                fills.push(fill);
            }
        }
        return fills;
    }

    // Taker path: the top-level fields are ours.
    let Some(fill) = extract_fill(val, status) else {
        return Vec::new();
    };
    let key = dedup_key(trade_id, &fill);
    if dedup.remember(key) {
        vec![fill]
    } else {
        Vec::new()
    }
}

fn extract_fill(val: &Value, status: FillStatus) -> Option<FillEvent> {
    // Asset ids are large decimal numbers; JSON may carry them as strings
    // or numbers, so normalize through to_string.
    let asset_id = val
        .get("asset_id")
        .map(|v| v.to_string().trim_matches('"').to_string())?;
    let size = parse_f64_field(val, "matched_amount").or_else(|| parse_f64_field(val, "size"))?;
    let price = parse_f64_field(val, "price")?;
    if size <= 0.0 || price <= 0.0 {
        return None;
    }
    let order_id = val
        .get("order_id")
        .or_else(|| val.get("taker_order_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    Some(FillEvent {
        order_id,
        asset_id,
        price,
        size,
        status,
        ts: Instant::now(),
    })
}

fn dedup_key(trade_id: &str, fill: &FillEvent) -> String {
    // MATCHED and CONFIRMED land in one success bucket so the same trade
    // is counted once even when both statuses are delivered.
    let bucket = match fill.status {
        FillStatus::Matched | FillStatus::Confirmed => "SUCCESS",
        FillStatus::Failed => "FAILED",
    };
    if !trade_id.is_empty() {
        format!("tid:{trade_id}:{}:{bucket}", fill.order_id)
    } else {
        format!(
            "oid:{}:{bucket}:{:.8}:{:.8}",
            fill.order_id, fill.price, fill.size
        )
    }
}

fn parse_f64_field(val: &Value, field: &str) -> Option<f64> {
    val.get(field).and_then(|v| {
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> DedupCache {
        DedupCache::new(Duration::from_secs(60), 64)
    }

    #[test]
    fn test_dedup_cache_blocks_replay() {
        let mut c = cache();
        assert!(c.remember("trade-1".into()));
        assert!(!c.remember("trade-1".into()));
        assert!(c.remember("trade-2".into()));
    }

    #[test]
    fn test_taker_fill_parsed_once() {
        let mut c = cache();
        let event = json!({
            "event_type": "trade",
            "status": "MATCHED",
            "id": "t-1",
            "asset_id": "123",
            "taker_order_id": "o-1",
            "size": "10",
            "price": "0.34"
        });
        let first = parse_trade_event(&event, "key", &mut c);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].order_id, "o-1");
        assert_eq!(first[0].asset_id, "123");
        assert!((first[0].size - 10.0).abs() < 1e-9);
        assert_eq!(first[0].status, FillStatus::Matched);

        // Replay of the same trade (e.g. CONFIRMED after MATCHED).
        let confirmed = json!({
            "event_type": "trade",
            "status": "CONFIRMED",
            "id": "t-1",
            "asset_id": "123",
            "taker_order_id": "o-1",
            "size": "10",
            "price": "0.34"
        });
        assert!(parse_trade_event(&confirmed, "key", &mut c).is_empty());
    }

    #[test]
    fn test_maker_fills_filtered_by_owner() {
        let mut c = cache();
        let event = json!({
            "event_type": "trade",
            "status": "MATCHED",
            "id": "t-2",
            "trader_side": "MAKER",
            "maker_orders": [
                { "owner": "key", "order_id": "ours", "asset_id": "123",
                  "matched_amount": "10", "price": "0.62" },
                { "owner": "somebody-else", "order_id": "theirs", "asset_id": "123",
                  "matched_amount": "4", "price": "0.62" }
            ]
        });
        let fills = parse_trade_event(&event, "KEY", &mut c);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, "ours");
    }

    #[test]
    fn test_retrying_status_ignored() {
        let mut c = cache();
        let event = json!({
            "event_type": "trade",
            "status": "RETRYING",
            "asset_id": "123",
            "size": "10",
            "price": "0.34"
        });
        assert!(parse_trade_event(&event, "key", &mut c).is_empty());
    }

    #[test]
    fn test_distinct_partial_fills_without_trade_id() {
        let mut c = cache();
        let make = |size: &str| {
            json!({
                "event_type": "trade",
                "status": "MATCHED",
                "asset_id": "123",
                "taker_order_id": "o-1",
                "size": size,
                "price": "0.51"
            })
        };
        assert_eq!(parse_trade_event(&make("1.0"), "key", &mut c).len(), 1);
        assert_eq!(parse_trade_event(&make("0.4"), "key", &mut c).len(), 1);
        assert!(parse_trade_event(&make("0.4"), "key", &mut c).is_empty());
    }
}
