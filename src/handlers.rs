//! HTTP handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::amount::f64_from_value;
use crate::autobot::{self, CycleOutcome, Trigger};
use crate::error::{Result, RuntimeError};
use crate::executor::TradeSource;
use crate::portfolio::Transaction;
use crate::reconciler::{self, SyncRequest};
use crate::runtime::Runtime;
use crate::state::RuntimeView;
use crate::types::{AccountSnapshot, BrokerOrder, TradeSide};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub broker_configured: bool,
    pub decision_configured: bool,
    pub profiles_configured: bool,
    pub feed: String,
    pub date: String,
}

#[derive(Debug, Serialize)]
pub struct RuntimeResponse {
    pub runtime: RuntimeView,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub outcome: CycleOutcome,
    pub runtime: RuntimeView,
}

/// Manual trade request; `qty` may arrive as a number or a string
#[derive(Debug, Deserialize)]
pub struct TradeRequest {
    pub symbol: String,
    pub side: String,
    pub qty: Value,
}

#[derive(Debug, Serialize)]
pub struct TradeResponse {
    pub order: BrokerOrder,
    pub snapshot: Option<AccountSnapshot>,
    pub transaction: Option<Transaction>,
}

/// GET /health
pub async fn health(State(rt): State<Arc<Runtime>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        broker_configured: rt.broker_configured(),
        decision_configured: rt.decision_configured(),
        profiles_configured: rt.profiles_configured(),
        feed: rt.config.alpaca_feed.clone(),
        date: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /runtime/state
pub async fn get_state(State(rt): State<Arc<Runtime>>) -> Result<Json<RuntimeResponse>> {
    Ok(Json(RuntimeResponse {
        runtime: rt.view().await?,
    }))
}

/// POST /runtime/sync
pub async fn sync(
    State(rt): State<Arc<Runtime>>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<RuntimeResponse>> {
    let runtime = reconciler::sync(&rt, request).await?;
    Ok(Json(RuntimeResponse { runtime }))
}

/// POST /runtime/run - manual autobot trigger
pub async fn run(State(rt): State<Arc<Runtime>>) -> Result<Json<RunResponse>> {
    info!("Manual autobot run requested");
    let outcome = autobot::run_cycle(&rt, Trigger::Manual).await;
    Ok(Json(RunResponse {
        outcome,
        runtime: rt.view().await?,
    }))
}

/// POST /trades
pub async fn submit_trade(
    State(rt): State<Arc<Runtime>>,
    Json(request): Json<TradeRequest>,
) -> Result<Json<TradeResponse>> {
    let side = TradeSide::parse(&request.side).ok_or_else(|| {
        RuntimeError::InvalidRequest(format!("side must be buy or sell, got '{}'", request.side))
    })?;
    let qty = f64_from_value(&request.qty)
        .filter(|q| q.is_finite() && *q >= 1.0 && q.fract() == 0.0)
        .ok_or_else(|| {
            RuntimeError::InvalidRequest("qty must be a positive whole number".to_string())
        })? as u64;

    let outcome = rt
        .executor
        .execute(&rt, &request.symbol, side, qty, TradeSource::Manual)
        .await?;
    Ok(Json(TradeResponse {
        order: outcome.order,
        snapshot: outcome.snapshot,
        transaction: outcome.transaction,
    }))
}
