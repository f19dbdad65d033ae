//! Dashboard HTTP API.
//!
//! Thin request/response mapping onto the registry and sessions; no
//! trading logic lives here.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::types::*;
use super::websocket::websocket_handler;
use crate::config;
use crate::registry::Registry;
use crate::types::PricePoint;

pub fn create_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/status", get(get_status))
        .route("/api/bots", get(list_bots).post(create_bot))
        .route(
            "/api/bots/:bot_id",
            get(get_bot).put(update_bot).delete(delete_bot),
        )
        .route("/api/bots/:bot_id/start", post(start_bot))
        .route("/api/bots/:bot_id/stop", post(stop_bot))
        .route("/api/bots/:bot_id/pause", post(pause_bot))
        .route("/api/bots/:bot_id/resume", post(resume_bot))
        .route("/api/bots/:bot_id/trade", post(manual_trade))
        .route("/api/bots/:bot_id/close", post(close_position))
        .route("/api/bots/:bot_id/activities", get(get_activities))
        .route("/api/bots/:bot_id/chart-data", get(get_chart_data))
        .route("/api/bots/:bot_id/orderbook", get(get_orderbook))
        .route("/api/bots/:bot_id/target", get(get_target))
        .route("/api/bots/:bot_id/spike-status", get(get_spike_status))
        .route("/api/bots/:bot_id/trades", get(get_trades))
        .route("/api/settings", get(get_settings).post(update_settings))
        .route("/api/profiles", get(get_profiles))
        .route("/api/kill", post(kill))
        .route("/ws", get(websocket_handler))
        .with_state(registry)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Map registry error strings onto HTTP status codes.
fn error_response(message: String) -> Response {
    let lower = message.to_lowercase();
    let (status, code) = if lower.contains("not found") {
        (StatusCode::NOT_FOUND, "not_found")
    } else if lower.contains("stop the bot") || lower.contains("not running") || lower.contains("not paused") {
        (StatusCode::CONFLICT, "conflict")
    } else if lower.contains("required") || lower.contains("must") || lower.contains("unknown") {
        (StatusCode::BAD_REQUEST, "invalid_request")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
    };
    (status, Json(ApiResponse::<()>::error(code, message))).into_response()
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "spikebot",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/status: process-level snapshot.
async fn get_status(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ApiResponse::success(json!({
        "uptime_seconds": registry.uptime_seconds(),
        "killswitch": registry.controls.killswitch(),
        "daily_realized_pnl_usd": registry.controls.daily_realized_pnl(),
        "bots": registry.status_counts(),
    })))
}

async fn list_bots(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ApiResponse::success(registry.snapshots()))
}

async fn create_bot(
    State(registry): State<Arc<Registry>>,
    Json(request): Json<CreateBotRequest>,
) -> Response {
    match registry.create_bot(
        &request.wallet_secret,
        request.profile.as_deref(),
        &request.config,
    ) {
        Ok(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    match registry.get(&bot_id) {
        Some(session) => Json(ApiResponse::success(session.shared.snapshot())).into_response(),
        None => error_response(format!("bot {bot_id} not found")),
    }
}

async fn update_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Json(request): Json<UpdateBotRequest>,
) -> Response {
    match registry.update_bot(&bot_id, &request.config, request.wallet_secret.as_deref()) {
        Ok(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    match registry.delete_bot(&bot_id, query.force).await {
        Ok(()) => Json(ApiResponse::success(json!({ "deleted": bot_id }))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn start_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    match registry.start_bot(&bot_id).await {
        Ok(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    match registry.stop_bot(&bot_id).await {
        Ok(snapshot) => Json(ApiResponse::success(snapshot)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn pause_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    match session.pause().await {
        Ok(()) => Json(ApiResponse::success(session.shared.snapshot())).into_response(),
        Err(e) => error_response(e),
    }
}

async fn resume_bot(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    match session.resume().await {
        Ok(()) => Json(ApiResponse::success(session.shared.snapshot())).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/bots/:id/trade: operator order, still pre-checked.
async fn manual_trade(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Json(request): Json<TradeRequest>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    let amount = request
        .amount_usd
        .unwrap_or_else(|| session.shared.config().trade_size_usd);
    match session.manual_trade(request.side, amount).await {
        Ok(result) => Json(ApiResponse::success(result)).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/bots/:id/close: force-close at market.
async fn close_position(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    match session.close_position().await {
        Ok(result) => Json(ApiResponse::success(result)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_activities(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Query(query): Query<ActivityQuery>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    let activities = session.shared.activities(query.limit, query.kind);
    Json(ApiResponse::success(activities)).into_response()
}

/// Take the last sample of each `resolution`-second bucket.
fn downsample(points: Vec<PricePoint>, resolution_sec: u64) -> Vec<PricePoint> {
    if resolution_sec <= 1 {
        return points;
    }
    let bucket_ms = resolution_sec as i64 * 1000;
    let mut out: Vec<PricePoint> = Vec::new();
    for point in points {
        let bucket = point.ts_ms / bucket_ms;
        match out.last_mut() {
            Some(last) if last.ts_ms / bucket_ms == bucket => *last = point,
            _ => out.push(point),
        }
    }
    out
}

async fn get_chart_data(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Query(query): Query<ChartQuery>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    let points = match session.shared.price_shared() {
        Some(price) => price.with_history(|h| h.recent(h.len())),
        None => Vec::new(),
    };
    let mut points = downsample(points, query.resolution);
    if points.len() > query.limit {
        points.drain(..points.len() - query.limit);
    }
    Json(ApiResponse::success(points)).into_response()
}

async fn get_orderbook(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
    Query(query): Query<OrderbookQuery>,
) -> Response {
    match registry.orderbook(&bot_id, query.depth).await {
        Ok(book) => Json(ApiResponse::success(book)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_target(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    Json(ApiResponse::success(session.shared.target())).into_response()
}

async fn get_spike_status(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    let Some(session) = registry.get(&bot_id) else {
        return error_response(format!("bot {bot_id} not found"));
    };
    Json(ApiResponse::success(session.shared.spike_status())).into_response()
}

/// GET /api/bots/:id/trades: closed-trade history from the CSV log.
async fn get_trades(
    State(registry): State<Arc<Registry>>,
    Path(bot_id): Path<String>,
) -> Response {
    if registry.get(&bot_id).is_none() {
        return error_response(format!("bot {bot_id} not found"));
    }
    match registry.store.load_trades(&bot_id) {
        Ok(trades) => Json(ApiResponse::success(trades)).into_response(),
        Err(e) => error_response(e.to_string()),
    }
}

async fn get_settings(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    Json(ApiResponse::success(registry.settings.current().as_ref().clone()))
}

async fn update_settings(
    State(registry): State<Arc<Registry>>,
    Json(settings): Json<config::GlobalSettings>,
) -> Response {
    match registry.update_settings(settings) {
        Ok(settings) => Json(ApiResponse::success(settings)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_profiles() -> impl IntoResponse {
    Json(ApiResponse::success(config::all_profiles()))
}

/// POST /api/kill: engage the global killswitch.
async fn kill(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    registry.engage_killswitch();
    Json(ApiResponse::success(json!({ "killswitch": true })))
}
