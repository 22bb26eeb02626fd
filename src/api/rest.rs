// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// Thin glue over the supervisor, risk engine, pattern service and telemetry
// bus. Every reply uses the standard envelope:
//
//   { "success": bool, "data": ..., "error": {code, message, details?},
//     "timestamp": ms }
//
// The health endpoint is public; everything else requires the `X-API-Key`
// header (when a key is configured). CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api::auth::ApiKey;
use crate::app_state::AppState;
use crate::config::TraderConfig;
use crate::error::ErrorKind;
use crate::pattern::{PatternQuery, PruneCriteria};
use crate::types::{CandleInterval, Exchange, StrategyKind};

// =============================================================================
// Response envelope
// =============================================================================

#[derive(Serialize)]
struct ApiError {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
    timestamp: i64,
}

fn ok<T: Serialize>(data: T) -> Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        error: None,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    Json(body).into_response()
}

fn fail(err: ErrorKind) -> Response {
    let status = match &err {
        ErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
        ErrorKind::InvalidArgument(_) | ErrorKind::InvariantViolation(_) => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::LimitExceeded(_) | ErrorKind::BadState(_) | ErrorKind::Emergency(_) => {
            StatusCode::CONFLICT
        }
        ErrorKind::RiskRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        ErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let details = match &err {
        ErrorKind::RiskRejected { violations } => {
            Some(serde_json::json!({ "violations": violations }))
        }
        _ => None,
    };

    let body = Envelope::<()> {
        success: false,
        data: None,
        error: Some(ApiError {
            code: err.code(),
            message: err.to_string(),
            details,
        }),
        timestamp: chrono::Utc::now().timestamp_millis(),
    };
    (status, Json(body)).into_response()
}

fn respond<T: Serialize>(result: Result<T, ErrorKind>) -> Response {
    match result {
        Ok(data) => ok(data),
        Err(err) => fail(err),
    }
}

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(service_health))
        // ── Traders ─────────────────────────────────────────────────
        .route("/api/v1/traders", get(list_traders).post(create_trader))
        .route(
            "/api/v1/traders/:id",
            get(get_trader).put(update_trader).delete(delete_trader),
        )
        .route("/api/v1/traders/:id/start", post(start_trader))
        .route("/api/v1/traders/:id/stop", post(stop_trader))
        .route("/api/v1/traders/:id/pause", post(pause_trader))
        .route("/api/v1/traders/:id/resume", post(resume_trader))
        .route("/api/v1/traders/:id/metrics", get(trader_metrics))
        .route("/api/v1/traders/:id/health", get(trader_health))
        .route("/api/v1/traders-health", get(fleet_health))
        // ── Positions ───────────────────────────────────────────────
        .route("/api/v1/positions", get(list_positions))
        // ── Risk ────────────────────────────────────────────────────
        .route("/api/v1/risk", get(risk_state))
        .route("/api/v1/risk/emergency-stop", post(global_emergency_stop))
        .route(
            "/api/v1/risk/emergency-stop/:id",
            post(trader_emergency_stop),
        )
        .route("/api/v1/risk/clear/:id", post(clear_emergency))
        // ── Patterns ────────────────────────────────────────────────
        .route("/api/v1/patterns", get(query_patterns))
        .route("/api/v1/patterns/prune", post(prune_patterns))
        .route("/api/v1/patterns/merge", post(merge_patterns))
        // ── Telemetry admin + WebSocket ─────────────────────────────
        .route("/api/v1/telemetry/connections", get(list_connections))
        .route(
            "/api/v1/telemetry/connections/:id/disconnect",
            post(disconnect_connection),
        )
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct ServiceHealth {
    status: &'static str,
    traders: usize,
    uptime_secs: u64,
    server_time: i64,
}

async fn service_health(State(state): State<Arc<AppState>>) -> Response {
    ok(ServiceHealth {
        status: "ok",
        traders: state.supervisor.count(),
        uptime_secs: state.uptime_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Trader DTOs
// =============================================================================

fn default_duration_secs() -> u64 {
    24 * 3600
}

fn default_leverage() -> u32 {
    1
}

/// Create / update payload. Enums use their wire names (e.g. `BINANCE`,
/// `TREND_FOLLOWING`, `ONE_HOUR`).
#[derive(Debug, Deserialize)]
pub struct TraderRequest {
    pub name: String,
    pub exchange: Exchange,
    pub symbol: String,
    pub max_stake_amount: f64,
    pub max_risk_level: u8,
    #[serde(default = "default_duration_secs")]
    pub max_trading_duration_secs: u64,
    #[serde(default)]
    pub min_return_percent: f64,
    pub strategy: StrategyKind,
    pub candlestick_interval: CandleInterval,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

impl TraderRequest {
    fn into_config(self, id: Option<String>) -> Result<TraderConfig, ErrorKind> {
        let mut builder = TraderConfig::builder(self.name)
            .exchange(self.exchange)
            .symbol(self.symbol)
            .max_stake_amount(self.max_stake_amount)
            .max_risk_level(self.max_risk_level)
            .max_trading_duration_secs(self.max_trading_duration_secs)
            .min_return_percent(self.min_return_percent)
            .strategy(self.strategy)
            .candlestick_interval(self.candlestick_interval)
            .leverage(self.leverage);
        if let Some(id) = id {
            builder = builder.id(id);
        }
        builder.build()
    }
}

#[derive(Serialize)]
struct CreatedTrader {
    id: String,
}

// =============================================================================
// Trader handlers
// =============================================================================

async fn create_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<TraderRequest>,
) -> Response {
    let config = match request.into_config(None) {
        Ok(config) => config,
        Err(err) => return fail(err),
    };
    info!(name = %config.name, "create trader requested");
    respond(
        state
            .supervisor
            .create(config)
            .await
            .map(|id| CreatedTrader { id }),
    )
}

async fn list_traders(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    ok(state.supervisor.list())
}

#[derive(Serialize)]
struct TraderDetail {
    config: TraderConfig,
    state: crate::types::TraderState,
    metrics: crate::metrics::MetricsSnapshot,
}

async fn get_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let detail = state.supervisor.get_config(&id).and_then(|config| {
        Ok(TraderDetail {
            state: state.supervisor.state(&id)?,
            metrics: state.supervisor.metrics(&id)?,
            config,
        })
    });
    respond(detail)
}

async fn update_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TraderRequest>,
) -> Response {
    let config = match request.into_config(Some(id.clone())) {
        Ok(config) => config,
        Err(err) => return fail(err),
    };
    respond(state.supervisor.update(&id, config).await)
}

async fn delete_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.delete(&id).await)
}

async fn start_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.start(&id).await)
}

async fn stop_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.stop(&id).await)
}

async fn pause_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.pause(&id).await)
}

async fn resume_trader(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.resume(&id).await)
}

async fn trader_metrics(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.metrics(&id))
}

async fn trader_health(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    respond(state.supervisor.health(&id))
}

async fn fleet_health(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    ok(state.supervisor.health_all())
}

// =============================================================================
// Position handlers
// =============================================================================

async fn list_positions(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    ok(state.positions.open_positions())
}

// =============================================================================
// Risk handlers
// =============================================================================

async fn risk_state(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    ok(state.risk.get_state())
}

#[derive(Debug, Deserialize)]
struct EmergencyStopRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn global_emergency_stop(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<EmergencyStopRequest>,
) -> Response {
    let reason = request
        .reason
        .unwrap_or_else(|| "manual global emergency stop".to_string());
    state.risk.global_emergency_stop(&reason).await;
    ok(serde_json::json!({ "stopped": true }))
}

async fn trader_emergency_stop(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<EmergencyStopRequest>,
) -> Response {
    let reason = request
        .reason
        .unwrap_or_else(|| "manual emergency stop".to_string());
    state.risk.emergency_stop_trader(&id, &reason).await;
    ok(serde_json::json!({ "stopped": true }))
}

async fn clear_emergency(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let cleared = state.risk.clear_emergency(&id);
    ok(serde_json::json!({ "cleared": cleared }))
}

// =============================================================================
// Pattern handlers
// =============================================================================

async fn query_patterns(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Query(criteria): Query<PatternQuery>,
) -> Response {
    ok(state.patterns.query(&criteria))
}

async fn prune_patterns(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Json(criteria): Json<PruneCriteria>,
) -> Response {
    respond(state.patterns.prune(&criteria))
}

async fn merge_patterns(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    respond(
        state
            .patterns
            .merge_similar()
            .map(|merges| serde_json::json!({ "merges": merges })),
    )
}

// =============================================================================
// Telemetry admin
// =============================================================================

async fn list_connections(_auth: ApiKey, State(state): State<Arc<AppState>>) -> Response {
    ok(state.bus.connections())
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn disconnect_connection(
    _auth: ApiKey,
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    Json(request): Json<DisconnectRequest>,
) -> Response {
    let reason = request
        .reason
        .unwrap_or_else(|| "disconnected by administrator".to_string());
    respond(state.bus.disconnect(id, reason))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trader_request_parses_wire_enums() {
        let json = serde_json::json!({
            "name": "T1",
            "exchange": "BINANCE",
            "symbol": "BTCUSDT",
            "max_stake_amount": 1000.0,
            "max_risk_level": 5,
            "strategy": "TREND_FOLLOWING",
            "candlestick_interval": "ONE_HOUR"
        });
        let request: TraderRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.exchange, Exchange::Binance);
        assert_eq!(request.strategy, StrategyKind::TrendFollowing);
        assert_eq!(request.leverage, 1);

        let config = request.into_config(None).unwrap();
        assert_eq!(config.symbol, "BTCUSDT");
    }

    #[test]
    fn invalid_request_surfaces_validation_message() {
        let json = serde_json::json!({
            "name": "T1",
            "exchange": "BINANCE",
            "symbol": "BTCUSDT",
            "max_stake_amount": -100.0,
            "max_risk_level": 5,
            "strategy": "TREND_FOLLOWING",
            "candlestick_interval": "ONE_HOUR"
        });
        let request: TraderRequest = serde_json::from_value(json).unwrap();
        let err = request.into_config(None).unwrap_err();
        assert_eq!(err.to_string(), "Max stake amount must be positive");
    }

    #[test]
    fn envelope_shapes() {
        let envelope = Envelope {
            success: true,
            data: Some(42),
            error: None,
            timestamp: 1,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error").is_none());

        let envelope = Envelope::<()> {
            success: false,
            data: None,
            error: Some(ApiError {
                code: "NOT_FOUND",
                message: "trader x".into(),
                details: None,
            }),
            timestamp: 1,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }
}
