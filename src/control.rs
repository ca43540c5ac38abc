//! Control API — the operator surface over the engine.
//!
//! Start/stop/pause, track or drop a market by URL or slug, emergency
//! unwind, and a status view of open positions. Commands are forwarded to
//! the engine over its command channel; the handlers never touch worker
//! state directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::info;

use crate::discovery;
use crate::scalping::book::BookMirror;
use crate::scalping::ledger::PositionLedger;
use crate::scalping::messages::{EngineCmd, RunState};
use crate::scalping::registry::MarketRegistry;

#[derive(Clone)]
pub struct ControlState {
    pub cmd_tx: mpsc::Sender<EngineCmd>,
    pub ledger: Arc<RwLock<PositionLedger>>,
    pub registry: Arc<RwLock<MarketRegistry>>,
    pub run_state: watch::Receiver<RunState>,
    pub mirror: BookMirror,
    pub gamma_url: String,
}

pub async fn serve(state: ControlState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(status))
        .route("/control/start", post(start))
        .route("/control/stop", post(stop))
        .route("/control/pause", post(pause))
        .route("/markets", post(add_market))
        .route("/markets/:id", delete(remove_market))
        .route("/markets/:id/unwind", post(unwind_market))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🕹 control API listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status(State(s): State<ControlState>) -> Json<Value> {
    let run_state = format!("{:?}", *s.run_state.borrow());
    let registry = s.registry.read().await;
    let ledger = s.ledger.read().await;

    let mut markets = Vec::new();
    for market in registry.iter() {
        let (_, yes_ask) = s.mirror.best_prices(&market.token_yes).await;
        let (_, no_ask) = s.mirror.best_prices(&market.token_no).await;
        let summary = ledger.summary(&market.id, yes_ask, no_ask).map(|p| {
            json!({
                "side": p.side.as_str(),
                "size": p.total_size,
                "avg_entry": p.avg_entry,
                "exit_price": p.exit_price,
                "unrealized_pnl": p.unrealized_pnl,
                "unrealized_pnl_pct": p.unrealized_pnl_pct,
                "num_positions": p.num_positions,
            })
        });
        markets.push(json!({
            "id": market.id,
            "slug": market.slug,
            "question": market.question,
            "end_time": market.end_time.to_rfc3339(),
            "yes_ask": yes_ask,
            "no_ask": no_ask,
            "completed_cycles": ledger.completed_cycles(&market.id),
            "high_scalps_opened": ledger.high_scalps_opened(&market.id),
            "position": summary,
        }));
    }

    Json(json!({ "state": run_state, "markets": markets }))
}

async fn start(State(s): State<ControlState>) -> StatusCode {
    let _ = s.cmd_tx.send(EngineCmd::Start).await;
    StatusCode::ACCEPTED
}

async fn stop(State(s): State<ControlState>) -> StatusCode {
    let _ = s.cmd_tx.send(EngineCmd::Stop).await;
    StatusCode::ACCEPTED
}

async fn pause(State(s): State<ControlState>) -> StatusCode {
    let _ = s.cmd_tx.send(EngineCmd::Pause).await;
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct AddMarketBody {
    url: Option<String>,
    slug: Option<String>,
}

async fn add_market(
    State(s): State<ControlState>,
    Json(body): Json<AddMarketBody>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let slug = body
        .slug
        .or_else(|| body.url.as_deref().and_then(discovery::slug_from_url))
        .ok_or((StatusCode::BAD_REQUEST, "need url or slug".to_string()))?;

    let market = discovery::resolve_market_by_slug(&s.gamma_url, &slug)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("{e:#}")))?;

    let id = market.id.clone();
    let _ = s.cmd_tx.send(EngineCmd::AddMarket(market)).await;
    Ok(Json(json!({ "id": id, "slug": slug })))
}

async fn remove_market(State(s): State<ControlState>, Path(id): Path<String>) -> StatusCode {
    let _ = s.cmd_tx.send(EngineCmd::RemoveMarket(id)).await;
    StatusCode::ACCEPTED
}

async fn unwind_market(State(s): State<ControlState>, Path(id): Path<String>) -> StatusCode {
    let _ = s.cmd_tx.send(EngineCmd::EmergencyUnwind(id)).await;
    StatusCode::ACCEPTED
}
