//! HTTP operator surface.
//!
//! Endpoints:
//! - `GET  /healthz`: liveness (process responsive)
//! - `GET  /readyz`: readiness (store reachable, exchange reachable,
//!   tasks hold leases for the live positions)
//! - `GET  /metrics`: Prometheus text
//! - `GET  /status`: position snapshots (`?symbol=`, `?state=`)
//! - `POST /positions`: arm
//! - `GET  /positions/:id`, `DELETE /positions/:id?force=`
//! - `POST /positions/:id/signal`: manual entry signal
//! - `POST /panic`: exit everything (`?symbol=`, requires `confirm=true`)
//! - `GET  /safety/status`, `POST /safety/test`
//!
//! Errors come back as `{kind, retryable, message}` with a stable kind
//! discriminator.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

use marlim_domain::{
    Position, PositionState, Price, RiskConfig, Side, Symbol, SymbolFilters, TechStopDistance,
};
use marlim_exec::{ExchangePort, MarketDataPort};
use marlim_store::Store;

use crate::error::DaemonError;
use crate::metrics::Metrics;
use crate::position_manager::PositionManager;
use crate::safety_net::SafetyNet;
use crate::signal_port::manual_signal;

// =============================================================================
// State
// =============================================================================

/// Shared state for handlers.
pub struct ApiState<E: ExchangePort + 'static, S: Store + 'static, M: MarketDataPort + 'static> {
    pub manager: Arc<PositionManager<E, S>>,
    pub safety: Arc<SafetyNet<E, S, M>>,
    pub store: Arc<S>,
    pub exchange: Arc<E>,
    pub metrics: Arc<Metrics>,
    pub degraded: Arc<std::sync::atomic::AtomicBool>,
    pub default_account: Uuid,
    pub risk_fraction_pct: Decimal,
}

type Shared<E, S, M> = Arc<ApiState<E, S, M>>;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub retryable: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub store: bool,
    pub exchange: bool,
    pub leases: bool,
    pub degraded: bool,
}

#[derive(Debug, Deserialize)]
pub struct ArmRequest {
    pub symbol: String,
    pub side: String,
    pub capital: Decimal,
    /// Absolute price distance to the technical invalidation level
    pub tech_stop_distance: Decimal,
    #[serde(default)]
    pub risk_fraction_pct: Option<Decimal>,
    #[serde(default)]
    pub account_id: Option<Uuid>,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub step_size: Option<Decimal>,
    /// Spawn the crossover detector for this position
    #[serde(default)]
    pub detector: bool,
}

#[derive(Debug, Serialize)]
pub struct ArmResponse {
    pub position_id: Uuid,
    pub symbol: String,
    pub side: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub symbol: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub live_positions: usize,
    pub degraded: bool,
    pub positions: Vec<PositionSummary>,
}

#[derive(Debug, Serialize)]
pub struct PositionSummary {
    pub id: Uuid,
    pub symbol: String,
    pub side: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    pub pnl: Decimal,
    pub fees_paid: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct DisarmQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct PanicQuery {
    pub symbol: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize)]
pub struct PanicResponse {
    pub positions: Vec<Uuid>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SafetyTestResponse {
    pub exchange_reachable: bool,
    pub visible_positions: usize,
}

// =============================================================================
// Router
// =============================================================================

pub fn create_router<E, S, M>(state: Shared<E, S, M>) -> Router
where
    E: ExchangePort + Send + Sync + 'static,
    S: Store + Send + Sync + 'static,
    M: MarketDataPort + Send + Sync + 'static,
{
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/positions", post(arm_handler))
        .route("/positions/:id", get(get_position_handler))
        .route("/positions/:id", delete(disarm_handler))
        .route("/positions/:id/signal", post(signal_handler))
        .route("/panic", post(panic_handler))
        .route("/safety/status", get(safety_status_handler))
        .route("/safety/test", post(safety_test_handler))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz<E, S, M>(
    State(state): State<Shared<E, S, M>>,
) -> (StatusCode, Json<ReadyResponse>)
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let store_ok = state.store.positions().list_active().await.is_ok();
    let exchange_ok = state.exchange.ping().await.is_ok();

    // Every live position must have its task (and therefore its lease)
    let leases_ok = match state.manager.live_positions().await {
        Ok(live) => live.is_empty() || state.manager.task_count().await > 0,
        Err(_) => false,
    };

    let ready = store_ok && exchange_ok && leases_ok;
    let body = ReadyResponse {
        ready,
        store: store_ok,
        exchange: exchange_ok,
        leases: leases_ok,
        degraded: state.degraded.load(Ordering::Relaxed),
    };

    let code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}

async fn metrics_handler<E, S, M>(State(state): State<Shared<E, S, M>>) -> String
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    state.metrics.render()
}

async fn status_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let mut positions = state
        .manager
        .live_positions()
        .await
        .map_err(error_response)?;

    if let Some(symbol) = &query.symbol {
        let symbol = Symbol::from_pair(symbol)
            .map_err(|e| error_response(DaemonError::Domain(e)))?;
        positions.retain(|p| p.symbol == symbol);
    }
    if let Some(state_name) = &query.state {
        positions.retain(|p| p.state.name() == state_name);
    }

    let summaries: Vec<PositionSummary> = positions.iter().map(summarize).collect();
    Ok(Json(StatusResponse {
        live_positions: summaries.len(),
        degraded: state.degraded.load(Ordering::Relaxed),
        positions: summaries,
    }))
}

async fn arm_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Json(request): Json<ArmRequest>,
) -> Result<(StatusCode, Json<ArmResponse>), (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let symbol = Symbol::from_pair(&request.symbol)
        .map_err(|e| error_response(DaemonError::Domain(e)))?;

    let side = match request.side.to_uppercase().as_str() {
        "LONG" | "BUY" => Side::Long,
        "SHORT" | "SELL" => Side::Short,
        other => {
            return Err(error_response(DaemonError::Config(format!(
                "invalid side: {} (expected LONG or SHORT)",
                other
            ))));
        },
    };

    let risk_config = RiskConfig::new(
        request.capital,
        request.risk_fraction_pct.unwrap_or(state.risk_fraction_pct),
    )
    .map_err(|e| error_response(DaemonError::Domain(e)))?;

    let distance = TechStopDistance::new(request.tech_stop_distance)
        .map_err(|e| error_response(DaemonError::Domain(e)))?;

    let filters = match (request.tick_size, request.step_size) {
        (Some(tick), Some(step)) => SymbolFilters::new(tick, step)
            .map_err(|e| error_response(DaemonError::Domain(e)))?,
        _ => SymbolFilters::default(),
    };

    let position = state
        .manager
        .arm_position(
            request.account_id.unwrap_or(state.default_account),
            symbol.clone(),
            side,
            risk_config,
            distance,
            filters,
        )
        .await
        .map_err(error_response)?;

    if request.detector {
        state
            .manager
            .spawn_detector(&position)
            .await
            .map_err(error_response)?;
    }

    Ok((
        StatusCode::CREATED,
        Json(ArmResponse {
            position_id: position.id,
            symbol: symbol.as_pair(),
            side: side.to_string(),
            state: position.state.name().to_string(),
        }),
    ))
}

async fn get_position_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PositionSummary>, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let position = state
        .manager
        .get_position(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(DaemonError::PositionNotFound(id)))?;

    Ok(Json(summarize(&position)))
}

async fn disarm_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DisarmQuery>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    state
        .manager
        .disarm(id, query.force)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

async fn signal_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Path(id): Path<Uuid>,
    Json(request): Json<SignalRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let position = state
        .manager
        .get_position(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(DaemonError::PositionNotFound(id)))?;

    let entry_price = Price::new(request.entry_price)
        .map_err(|e| error_response(DaemonError::Domain(e)))?;
    let signal =
        manual_signal(&position, entry_price).map_err(error_response)?;

    state
        .manager
        .route_signal(signal)
        .await
        .map_err(error_response)?;

    Ok(StatusCode::ACCEPTED)
}

async fn panic_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
    Query(query): Query<PanicQuery>,
) -> Result<Json<PanicResponse>, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    if !query.confirm {
        return Err(error_response(DaemonError::ConfirmationRequired(
            "panic requires confirm=true".to_string(),
        )));
    }

    let symbol = match &query.symbol {
        Some(raw) => Some(
            Symbol::from_pair(raw).map_err(|e| error_response(DaemonError::Domain(e)))?,
        ),
        None => None,
    };

    let positions = state
        .manager
        .panic(symbol.as_ref())
        .await
        .map_err(error_response)?;

    Ok(Json(PanicResponse {
        count: positions.len(),
        positions,
    }))
}

async fn safety_status_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
) -> Json<crate::safety_net::SafetyStatus>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    Json(state.safety.status().await)
}

async fn safety_test_handler<E, S, M>(
    State(state): State<Shared<E, S, M>>,
) -> Result<Json<SafetyTestResponse>, (StatusCode, Json<ErrorBody>)>
where
    E: ExchangePort + 'static,
    S: Store + 'static,
    M: MarketDataPort + 'static,
{
    let visible = state.safety.self_test().await.map_err(error_response)?;
    Ok(Json(SafetyTestResponse {
        exchange_reachable: true,
        visible_positions: visible,
    }))
}

// =============================================================================
// Helpers
// =============================================================================

fn error_response(error: DaemonError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &error {
        DaemonError::PositionNotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::InvalidPositionState { .. } => StatusCode::CONFLICT,
        DaemonError::Lease(marlim_lease::LeaseError::Conflict(_)) => {
            StatusCode::PRECONDITION_FAILED
        },
        DaemonError::ConfirmationRequired(_) => StatusCode::PRECONDITION_REQUIRED,
        DaemonError::Domain(_) | DaemonError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DaemonError::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = ErrorBody {
        kind: error.kind().to_string(),
        retryable: error.retryable(),
        message: error.to_string(),
    };

    (status, Json(body))
}

fn summarize(position: &Position) -> PositionSummary {
    let trailing_stop = match &position.state {
        PositionState::Active { trailing_stop, .. } => Some(trailing_stop.as_decimal()),
        PositionState::Exiting { .. } => None,
        PositionState::Closed { exit_price, .. } => exit_price.map(|p| p.as_decimal()),
        _ => None,
    };

    PositionSummary {
        id: position.id,
        symbol: position.symbol.as_pair(),
        side: position.side.to_string(),
        state: position.state.name().to_string(),
        entry_price: position.entry_price.map(|p| p.as_decimal()),
        trailing_stop,
        quantity: position.quantity.map(|q| q.as_decimal()),
        pnl: position.pnl(),
        fees_paid: position.fees_paid,
    }
}

// =============================================================================
// Tests
// =============================================================================
