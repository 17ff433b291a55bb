// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Query reads go through the cache tier
// and answer with the envelope `{status, data, metadata{cache_hit,
// elapsed_ms}}`; failures answer `{status:"error", error:{kind, message,
// retry_after_ms?}}`. Unknown symbols or expiries return empty data, never an
// error. CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::app_state::AppState;
use crate::cache::keys;
use crate::errors::QueryError;
use crate::store::rows::{ExpiryMetricsRow, SeriesPoint, StrikeBarRow};
use crate::types::{parse_expiry, Indicator, OptionSide, StrikeRange, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST + WebSocket router with CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/fo/strike-distribution", get(strike_distribution))
        .route("/api/v1/fo/moneyness-series", get(moneyness_series))
        .route("/api/v1/fo/strike-history", get(strike_history))
        .route("/api/v1/fo/expiries", get(expiries))
        .route("/api/v1/fo/stream", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Response envelope
// =============================================================================

#[derive(Debug, Serialize)]
struct Metadata {
    cache_hit: bool,
    elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    status: &'static str,
    data: T,
    metadata: Metadata,
}

fn ok<T: Serialize>(data: T, cache_hit: bool, started: Instant) -> Json<Envelope<T>> {
    Json(Envelope {
        status: "ok",
        data,
        metadata: Metadata {
            cache_hit,
            elapsed_ms: started.elapsed().as_millis() as u64,
        },
    })
}

/// Query failure carrier with the structured error body.
pub struct ApiFailure(pub QueryError);

impl From<QueryError> for ApiFailure {
    fn from(e: QueryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let (status, retry_after_ms) = match &self.0 {
            QueryError::Validation(_) => (StatusCode::BAD_REQUEST, None),
            QueryError::ServiceUnavailable { retry_after_ms } => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(*retry_after_ms))
            }
        };
        let body = serde_json::json!({
            "status": "error",
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
                "retry_after_ms": retry_after_ms,
            },
        });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Parameter parsing helpers
// =============================================================================

fn parse_timeframe(s: &str) -> Result<Timeframe, QueryError> {
    Timeframe::parse(s)
        .ok_or_else(|| QueryError::Validation(format!("unknown timeframe '{s}'")))
}

fn parse_indicator(s: &str) -> Result<Indicator, QueryError> {
    Indicator::parse(s)
        .ok_or_else(|| QueryError::Validation(format!("unknown indicator '{s}'")))
}

fn parse_side(s: &str) -> Result<OptionSide, QueryError> {
    OptionSide::from_wire(s)
        .ok_or_else(|| QueryError::Validation(format!("unknown option side '{s}'")))
}

/// Comma-separated `YYYY-MM-DD` list.
fn parse_expiries(raw: &str) -> Result<Vec<NaiveDate>, QueryError> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse_expiry(s.trim())
                .ok_or_else(|| QueryError::Validation(format!("malformed expiry '{s}'")))
        })
        .collect()
}

/// `low-high` strike window.
fn parse_strike_range(raw: &str) -> Result<StrikeRange, QueryError> {
    let err = || QueryError::Validation(format!("malformed strike_range '{raw}'"));
    let (low, high) = raw.split_once('-').ok_or_else(err)?;
    let low: f64 = low.trim().parse().map_err(|_| err())?;
    let high: f64 = high.trim().parse().map_err(|_| err())?;
    if low > high {
        return Err(err());
    }
    Ok(StrikeRange { low, high })
}

fn validate_window(from: i64, to: i64) -> Result<(), QueryError> {
    if from > to {
        return Err(QueryError::Validation(format!(
            "from ({from}) is after to ({to})"
        )));
    }
    Ok(())
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_health())
}

// =============================================================================
// Strike distribution
// =============================================================================

#[derive(Deserialize)]
struct DistributionParams {
    symbol: String,
    timeframe: String,
    indicator: String,
    expiries: String,
    #[serde(default)]
    strike_range: Option<String>,
}

/// Latest per-expiry rows plus derived metrics, as one cacheable unit.
#[derive(Debug, Serialize, Deserialize)]
struct DistributionData {
    strikes: Vec<StrikeBarRow>,
    expiry_metrics: Vec<ExpiryMetricsRow>,
}

async fn strike_distribution(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DistributionParams>,
) -> Result<impl IntoResponse, ApiFailure> {
    let started = Instant::now();
    let timeframe = parse_timeframe(&params.timeframe)?;
    let indicator = parse_indicator(&params.indicator)?;
    let expiries = parse_expiries(&params.expiries)?;
    let strike_range = params
        .strike_range
        .as_deref()
        .map(parse_strike_range)
        .transpose()?;

    let ttl = std::time::Duration::from_secs(state.runtime_config.read().cache_ttl.latest);
    let key = keys::latest_key(&params.symbol, timeframe, indicator, &expiries);

    let store = state.store.clone();
    let symbol = params.symbol.clone();
    let fetch_expiries = expiries.clone();
    let (data, cache_hit) = state
        .cache
        .get_or_fetch(&key, ttl, move || async move {
            let strikes = store.fetch_latest_strikes(
                &symbol,
                timeframe,
                &fetch_expiries,
                strike_range,
                None,
            )?;
            let expiry_metrics =
                store.fetch_latest_expiry_metrics(&symbol, timeframe, &fetch_expiries)?;
            Ok(DistributionData {
                strikes,
                expiry_metrics,
            })
        })
        .await?;

    Ok(ok(data, cache_hit, started))
}

// =============================================================================
// Moneyness series
// =============================================================================

#[derive(Deserialize)]
struct SeriesParams {
    symbol: String,
    timeframe: String,
    indicator: String,
    option_side: String,
    expiries: String,
    from: i64,
    to: i64,
}

async fn moneyness_series(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesParams>,
) -> Result<impl IntoResponse, ApiFailure> {
    let started = Instant::now();
    let timeframe = parse_timeframe(&params.timeframe)?;
    let indicator = parse_indicator(&params.indicator)?;
    let side = parse_side(&params.option_side)?;
    let expiries = parse_expiries(&params.expiries)?;
    validate_window(params.from, params.to)?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let ttl = keys::series_ttl(&state.runtime_config.read().cache_ttl, params.to, now_ms);
    let key = keys::series_key(
        &params.symbol,
        timeframe,
        indicator,
        side,
        &expiries,
        params.from,
        params.to,
    );

    let store = state.store.clone();
    let symbol = params.symbol.clone();
    let (from, to) = (params.from, params.to);
    let fetch_expiries = expiries.clone();
    let (data, cache_hit): (Vec<SeriesPoint>, bool) = state
        .cache
        .get_or_fetch(&key, ttl, move || async move {
            Ok(store.fetch_strike_series(
                &symbol,
                timeframe,
                &fetch_expiries,
                indicator,
                side,
                from,
                to,
            )?)
        })
        .await?;

    Ok(ok(data, cache_hit, started))
}

// =============================================================================
// Strike history
// =============================================================================

#[derive(Deserialize)]
struct HistoryParams {
    symbol: String,
    strike: f64,
    expiry: String,
    timeframe: String,
    from: i64,
    to: i64,
}

async fn strike_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, ApiFailure> {
    let started = Instant::now();
    let timeframe = parse_timeframe(&params.timeframe)?;
    let expiry = parse_expiry(&params.expiry)
        .ok_or_else(|| QueryError::Validation(format!("malformed expiry '{}'", params.expiry)))?;
    validate_window(params.from, params.to)?;

    let ttl =
        std::time::Duration::from_secs(state.runtime_config.read().cache_ttl.series_historical);
    let key = keys::history_key(
        &params.symbol,
        timeframe,
        expiry,
        params.strike,
        params.from,
        params.to,
    );

    let store = state.store.clone();
    let symbol = params.symbol.clone();
    let (strike, from, to) = (params.strike, params.from, params.to);
    let (data, cache_hit): (Vec<StrikeBarRow>, bool) = state
        .cache
        .get_or_fetch(&key, ttl, move || async move {
            Ok(store.fetch_strike_history(&symbol, strike, expiry, timeframe, from, to)?)
        })
        .await?;

    Ok(ok(data, cache_hit, started))
}

// =============================================================================
// Expiry listing (static lookup)
// =============================================================================

#[derive(Deserialize)]
struct ExpiriesParams {
    symbol: String,
}

async fn expiries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExpiriesParams>,
) -> Result<impl IntoResponse, ApiFailure> {
    let started = Instant::now();
    let ttl =
        std::time::Duration::from_secs(state.runtime_config.read().cache_ttl.static_lookup);
    let key = keys::static_expiries_key(&params.symbol);

    let store = state.store.clone();
    let symbol = params.symbol.clone();
    let (data, cache_hit): (Vec<NaiveDate>, bool) = state
        .cache
        .get_or_fetch(&key, ttl, move || async move {
            Ok(store.list_expiries(&symbol)?)
        })
        .await?;

    Ok(ok(data, cache_hit, started))
}
