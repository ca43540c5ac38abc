//! polyscalp — scalping engine for short-duration binary markets.
//!
//! Wiring: book mirror + user feed actors, the engine with its per-market
//! workers, the control API, and a discovery loop that rotates through the
//! recurring 15-minute market family.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use polyscalp::control::{self, ControlState};
use polyscalp::discovery;
use polyscalp::scalping::book::{BookMirror, MirrorConfig};
use polyscalp::scalping::fills::{UserFeed, UserFeedConfig};
use polyscalp::scalping::ledger::PositionLedger;
use polyscalp::scalping::messages::{EngineCmd, RunState};
use polyscalp::scalping::orchestrator::{Engine, EngineConfig};
use polyscalp::scalping::registry::{MarketRegistry, RegistryConfig};
use polyscalp::scalping::strategy::{Strategy, StrategyConfig};
use polyscalp::scalping::venue::VenueClient;
use polyscalp::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = init_tracing();

    info!("═══════════════════════════════════════════════════");
    info!("  polyscalp — binary-market scalping engine");
    info!("═══════════════════════════════════════════════════");

    let settings = Settings::from_env();
    let strategy_cfg = StrategyConfig::from_env();
    let engine_cfg = EngineConfig::from_env();
    info!(
        "📊 config: levels={:?} size={:.0} tp={:.0}% cycles≤{} scalp≥{:.2} dry={}",
        strategy_cfg.entry_levels,
        strategy_cfg.level_size,
        strategy_cfg.level_profit_target * 100.0,
        strategy_cfg.max_completed_cycles,
        strategy_cfg.high_scalp_threshold,
        !settings.trading_enabled,
    );

    let creds = settings.credentials();
    if settings.trading_enabled && creds.is_none() {
        anyhow::bail!(
            "🚨 FATAL: TRADING_ENABLED=true but credentials are incomplete. \
             Set the POLYMARKET_API_* variables or run with TRADING_ENABLED=false."
        );
    }
    if !settings.trading_enabled {
        warn!("📝 TRADING DISABLED — dry run, orders are simulated");
    }

    // ─── Channels ───
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (update_tx, update_rx) = mpsc::channel(512);
    let (fill_tx, fill_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (state_tx, state_rx) = watch::channel(RunState::Running);

    // ─── Actors ───
    let mirror = BookMirror::spawn(
        MirrorConfig {
            ws_url: format!("{}/market", settings.ws_base_url.trim_end_matches('/')),
            ..MirrorConfig::default()
        },
        update_tx,
        shutdown_rx.clone(),
    );

    let user_feed = match (&creds, settings.trading_enabled) {
        (Some(c), true) => {
            info!("👤 live mode: user feed is the fill source");
            Some(UserFeed::spawn(
                UserFeedConfig {
                    ws_base_url: settings.ws_base_url.clone(),
                    api_key: c.api_key.clone(),
                    api_secret: c.secret.clone(),
                    api_passphrase: c.passphrase.clone(),
                },
                fill_tx.clone(),
                shutdown_rx.clone(),
            ))
        }
        _ => None,
    };

    let venue = Arc::new(VenueClient::new(
        &settings.rest_url,
        creds,
        settings.trading_enabled,
    ));
    let ledger = Arc::new(RwLock::new(PositionLedger::new()));
    let registry = Arc::new(RwLock::new(MarketRegistry::new(RegistryConfig::default())));

    let engine = Engine::new(
        engine_cfg,
        Strategy::new(strategy_cfg),
        venue,
        mirror.clone(),
        user_feed,
        ledger.clone(),
        registry.clone(),
        state_tx,
    );
    let engine_task = tokio::spawn(engine.run(cmd_rx, fill_rx, update_rx));

    // ─── Control API ───
    let control_addr: SocketAddr = settings
        .control_addr
        .parse()
        .context("bad CONTROL_ADDR")?;
    let control_state = ControlState {
        cmd_tx: cmd_tx.clone(),
        ledger,
        registry,
        run_state: state_rx,
        mirror,
        gamma_url: settings.gamma_url.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = control::serve(control_state, control_addr).await {
            warn!("control API stopped: {e:#}");
        }
    });

    // ─── Discovery rotation ───
    tokio::spawn(discovery_loop(
        settings.gamma_url.clone(),
        settings.market_slug.clone(),
        cmd_tx.clone(),
        shutdown_rx,
    ));

    // ─── Run until ctrl-c ───
    tokio::signal::ctrl_c().await?;
    info!("🛑 ctrl-c — shutting down");
    let _ = shutdown_tx.send(true);
    let _ = cmd_tx.send(EngineCmd::Stop).await;
    drop(cmd_tx);
    if tokio::time::timeout(Duration::from_secs(5), engine_task)
        .await
        .is_err()
    {
        warn!("engine did not stop in time");
    }
    Ok(())
}

/// Resolve and track the live market window; in prefix mode, rotate to the
/// next window as each one ends. The engine applies its own admission rules
/// (expiry distance, market cap), so a rejected round just waits out the
/// window.
async fn discovery_loop(
    gamma_url: String,
    slug: String,
    cmd_tx: mpsc::Sender<EngineCmd>,
    mut shutdown: watch::Receiver<bool>,
) {
    let prefix_mode = discovery::is_prefix_slug(&slug);
    if prefix_mode {
        info!("🔄 rotating through '{slug}' windows");
    } else {
        info!("📌 fixed market: {slug}");
    }

    let mut round = 0u64;
    loop {
        if *shutdown.borrow() {
            return;
        }
        round += 1;

        let (current, end_ts) = if prefix_mode {
            discovery::current_slug(&slug, Utc::now())
        } else {
            (slug.clone(), 0)
        };
        info!("— round #{round}: {current}");

        let wait = match discovery::resolve_market_by_slug(&gamma_url, &current).await {
            Ok(market) => {
                let _ = cmd_tx.send(EngineCmd::AddMarket(market)).await;
                if !prefix_mode {
                    return; // single market, nothing further to discover
                }
                // Hold until just past this window's end, then rotate.
                let remaining = end_ts - Utc::now().timestamp();
                Duration::from_secs(remaining.max(1) as u64 + 3)
            }
            Err(e) => {
                warn!("❌ resolve '{current}' failed: {e:#} — retrying in 10s");
                Duration::from_secs(10)
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() { return; }
            }
        }
    }
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match std::env::var("SCALP_LOG_DIR") {
        Ok(dir) => {
            let file = tracing_appender::rolling::daily(dir, "polyscalp.log");
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}
