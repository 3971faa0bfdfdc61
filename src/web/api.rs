use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::{AppState, HealthResponse};
use crate::dashboard::{Outcome, OutcomeStatus};
use crate::database::LedgerError;
use crate::types::Symbol;

fn ledger_failure(e: LedgerError) -> Response {
    error!("Ledger error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
}

fn outcome_response(outcome: Outcome, success: StatusCode) -> Response {
    let status = match outcome.status {
        OutcomeStatus::Completed => success,
        OutcomeStatus::NotFound => StatusCode::NOT_FOUND,
        OutcomeStatus::AlreadyClosed => StatusCode::CONFLICT,
        OutcomeStatus::Rejected => StatusCode::BAD_REQUEST,
        OutcomeStatus::MarketUnavailable => StatusCode::BAD_GATEWAY,
    };
    (status, Json(outcome)).into_response()
}

fn parse_symbol(raw: &str) -> Result<Symbol, Response> {
    raw.parse::<Symbol>()
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({"error": e}))).into_response())
}

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn get_overview(State(state): State<AppState>) -> Response {
    match state.dashboard.overview().await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => ledger_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    #[serde(default = "default_open")]
    pub open: bool,
}

fn default_open() -> bool {
    true
}

pub async fn get_positions(
    State(state): State<AppState>,
    Query(query): Query<PositionsQuery>,
) -> Response {
    match state.dashboard.ledger().list_positions(query.open).await {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => ledger_failure(e),
    }
}

pub async fn get_position(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.dashboard.position(id).await {
        Ok(Some(position)) => Json(position).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Position #{} does not exist", id)})),
        )
            .into_response(),
        Err(e) => ledger_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenPositionRequest {
    pub symbol: String,
    pub invest_usdt: Decimal,
}

pub async fn post_open_position(
    State(state): State<AppState>,
    Json(req): Json<OpenPositionRequest>,
) -> Response {
    let symbol = match parse_symbol(&req.symbol) {
        Ok(symbol) => symbol,
        Err(resp) => return resp,
    };

    info!("Open requested: {} USDT of {}", req.invest_usdt, symbol);
    match state.dashboard.open_position(&symbol, req.invest_usdt).await {
        Ok(outcome) => outcome_response(outcome, StatusCode::CREATED),
        Err(e) => ledger_failure(e),
    }
}

pub async fn post_close_position(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    info!("Close requested for position #{}", id);
    match state.dashboard.close_position(id).await {
        Ok(outcome) => outcome_response(outcome, StatusCode::OK),
        Err(e) => ledger_failure(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AnalysisQuery {
    pub symbol: String,
}

pub async fn get_analysis(
    State(state): State<AppState>,
    Query(query): Query<AnalysisQuery>,
) -> Response {
    match parse_symbol(&query.symbol) {
        Ok(symbol) => Json(state.dashboard.analyze(&symbol).await).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_watchlist(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "symbols": state.dashboard.watchlist(),
        "min_investment": state.dashboard.min_investment(),
    }))
}
