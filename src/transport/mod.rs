//! HTTP+JSON transport.
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | `GET` | `/api/upd?seq=N` | `ok` diff, `reload`, or `fail`; parks while current |
//! | `GET` | `/api/full` | `full` snapshot with `evq` |
//! | `GET` | `/api/log?id=ID` | latest poll log of one server |
//! | `GET` | `/api/stats` | feed and ingest counters |
//! | `GET` | `/health` | liveness |
//!
//! Every response carries `Cache-Control: no-cache`. A client that
//! disconnects during a long poll drops the handler future, which cancels
//! its waiter.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::StatfanError;
use crate::service::StatusService;

/// Shared handler state.
pub type AppState = Arc<StatusService>;

/// Build the public router.
pub fn build_router(service: AppState) -> Router {
    Router::new()
        .route("/api/upd", get(get_update))
        .route("/api/full", get(get_full))
        .route("/api/log", get(get_log))
        .route("/api/stats", get(get_stats))
        .route("/health", get(health))
        .with_state(service)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(
            // Path only: query strings carry client cursors and entity ids.
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::debug_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        )
}

#[derive(Debug, Deserialize)]
struct UpdQuery {
    seq: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    id: Option<String>,
}

// Retryable failures are 503 so clients back off and ask again; anything
// else is a server fault.
fn fail_response(err: &StatfanError) -> Response {
    let status = if err.is_retryable() {
        tracing::warn!(error = %err, "snapshot request failed");
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        tracing::error!(error = %err, "snapshot request failed");
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({"result": "fail"}))).into_response()
}

/// `GET /api/upd?seq=N`
async fn get_update(State(svc): State<AppState>, Query(q): Query<UpdQuery>) -> impl IntoResponse {
    Json(svc.get_update(q.seq.as_deref()).await)
}

/// `GET /api/full`
async fn get_full(State(svc): State<AppState>) -> Response {
    match svc.full_snapshot() {
        Ok(full) => Json(full).into_response(),
        Err(e) => fail_response(&e),
    }
}

/// `GET /api/log?id=ID`
async fn get_log(State(svc): State<AppState>, Query(q): Query<LogQuery>) -> Response {
    match svc.entity_log(q.id.as_deref()) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => fail_response(&e),
    }
}

async fn get_stats(State(svc): State<AppState>) -> impl IntoResponse {
    Json(svc.stats())
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
