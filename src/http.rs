//! Axum router and HTTP handlers.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers (CORS, tracing) so tests can drive the bare router.
//! Every endpoint answers the `{success, data?, error?}` envelope.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::MachineId;
use crate::observability;

pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/machines", get(list_machines))
        .route("/api/machines/:id/hold", post(acquire_hold))
        .route("/api/machines/:id/confirm", post(confirm))
        .route("/api/machines/:id/release", post(release))
        .route("/api/machines/:id/cancel", post(cancel))
        .with_state(engine)
}

// ── Request payloads ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ScopeQuery {
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HoldRequest {
    pub holder: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub holder: String,
    pub hold_token: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub hold_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub holder: String,
    pub scope: Option<String>,
}

// ── Envelope and error mapping ───────────────────────────────────

fn ok(data: impl Serialize) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "success": true, "data": data })),
    )
        .into_response()
}

fn fail(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}

/// Contention → 409, absent → 404, bad input → 400, store fault → 500.
fn engine_err(e: EngineError) -> Response {
    let status = match &e {
        EngineError::AlreadyHeld(_)
        | EngineError::AlreadyBooked(_)
        | EngineError::AlreadyExists(_)
        | EngineError::InvalidOrExpiredHold => StatusCode::CONFLICT,
        EngineError::UnknownMachine(_)
        | EngineError::LockNotFound
        | EngineError::BookingNotFound => StatusCode::NOT_FOUND,
        EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
        EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, e.to_string())
}

fn record_op(op: &'static str, success: bool, start: Instant) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(observability::OPS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::OP_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
}

// ── Handlers ─────────────────────────────────────────────────────

async fn health() -> Response {
    ok(json!({ "status": "OK", "timestamp": crate::engine::now_ms() }))
}

async fn list_machines(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<ScopeQuery>,
) -> Response {
    let start = Instant::now();
    let views = engine.list_state(q.scope).await;
    record_op("list_state", true, start);
    ok(views)
}

async fn acquire_hold(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<MachineId>,
    Json(req): Json<HoldRequest>,
) -> Response {
    let start = Instant::now();
    let result = engine.acquire_hold(id, &req.holder, req.scope).await;
    record_op("acquire_hold", result.is_ok(), start);
    match result {
        Ok(token) => ok(json!({ "hold_token": token.to_string() })),
        Err(e) => engine_err(e),
    }
}

async fn confirm(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<MachineId>,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    let start = Instant::now();
    // A malformed token can't match any hold
    let Ok(token) = Ulid::from_string(&req.hold_token) else {
        record_op("confirm", false, start);
        return engine_err(EngineError::InvalidOrExpiredHold);
    };
    let result = engine.confirm(id, &req.holder, token, req.scope).await;
    record_op("confirm", result.is_ok(), start);
    match result {
        Ok(()) => ok(json!({ "message": "machine booked" })),
        Err(e) => engine_err(e),
    }
}

async fn release(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<MachineId>,
    Json(req): Json<ReleaseRequest>,
) -> Response {
    let start = Instant::now();
    let Ok(token) = Ulid::from_string(&req.hold_token) else {
        record_op("release", false, start);
        return engine_err(EngineError::LockNotFound);
    };
    let result = engine.release(id, token).await;
    record_op("release", result.is_ok(), start);
    match result {
        Ok(()) => ok(json!({ "message": "hold released" })),
        Err(e) => engine_err(e),
    }
}

async fn cancel(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<MachineId>,
    Json(req): Json<CancelRequest>,
) -> Response {
    let start = Instant::now();
    let result = engine.cancel_confirmed(id, &req.holder, req.scope).await;
    record_op("cancel_confirmed", result.is_ok(), start);
    match result {
        Ok(()) => ok(json!({ "message": "booking cancelled" })),
        Err(e) => engine_err(e),
    }
}
