// Operator HTTP surface: health, key health, stats, request inspection,
// logs, rate-limit snapshots, and the dashboard. Grounded on the plain
// handler-per-route style in `engine/webchat/server.rs` — small functions
// taking `State<Arc<AppState>>` and returning `impl IntoResponse`, no
// handler-level abstraction beyond what axum gives for free.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::health::HealthWorker;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
    keys_configured: usize,
}

/// `GET /health` — unauthenticated liveness probe. Does not touch the
/// upstream; only reports process-local state.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: state.config.app_version.clone(),
        keys_configured: state.keys.len(),
    })
}

#[derive(Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    force: bool,
}

/// `GET /health/keys?force=true` — cached per-key health snapshot,
/// optionally forcing a synchronous probe round first.
pub async fn health_keys(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ForceQuery>,
) -> impl IntoResponse {
    if q.force {
        let worker = HealthWorker::new(
            state.keys.clone(),
            state.penalties.clone(),
            state.usage.clone(),
            state.config.upstream_base_url.clone(),
            state.health.clone(),
        );
        worker.run_iteration(true).await;
    }
    Json(state.health.snapshot())
}

/// `POST /health/keys/{i}/reset` — operator reset: clear penalty state and
/// re-probe the key immediately.
pub async fn reset_key(
    State(state): State<Arc<AppState>>,
    Path(i): Path<usize>,
) -> impl IntoResponse {
    if state.keys.credential(i).is_none() {
        return (StatusCode::NOT_FOUND, "no such key index").into_response();
    }
    let worker = HealthWorker::new(
        state.keys.clone(),
        state.penalties.clone(),
        state.usage.clone(),
        state.config.upstream_base_url.clone(),
        state.health.clone(),
    );
    worker.reset_key(i).await;
    Json(json!({"reset": i})).into_response()
}

/// `POST /health/keys/{i}/penalize` — operator force-penalize.
pub async fn penalize_key(
    State(state): State<Arc<AppState>>,
    Path(i): Path<usize>,
) -> impl IntoResponse {
    if state.keys.credential(i).is_none() {
        return (StatusCode::NOT_FOUND, "no such key index").into_response();
    }
    state.penalties.force_penalize(i, Instant::now());
    let worker = HealthWorker::new(
        state.keys.clone(),
        state.penalties.clone(),
        state.usage.clone(),
        state.config.upstream_base_url.clone(),
        state.health.clone(),
    );
    worker.force_penalize_key(i);
    Json(json!({"penalized": i})).into_response()
}

/// `GET /stats` — overall totals plus per-key breakdown.
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let total = state.usage.total_tokens().unwrap_or(0);
    let per_key = state.usage.per_key_totals().unwrap_or_default();
    Json(json!({
        "total_tokens": total,
        "per_key_totals": per_key,
    }))
}

#[derive(Deserialize)]
pub struct WindowQuery {
    #[serde(default = "default_window")]
    window: i64,
}

fn default_window() -> i64 {
    1
}

/// `GET /stats/minute?window=N` — token throughput over the last N minutes.
pub async fn stats_minute(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = q.window.max(1);
    let tokens = state.usage.tokens_per_minute(window).unwrap_or(0);
    Json(json!({"window_minutes": window, "tokens": tokens}))
}

/// `GET /stats/24h` — token total over the last 24 hours.
pub async fn stats_24h(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tokens = state.usage.tokens_last_24h().unwrap_or(0);
    Json(json!({"tokens": tokens}))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// `GET /queries?limit=N` — recent request log rows, newest first.
pub async fn queries(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.usage.list_requests(q.limit.max(1)) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `GET /queries/{id}/body` — decompress and return the archived raw body.
pub async fn query_body(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let path = match state.usage.request_body_path(id) {
        Ok(Some(p)) => p,
        Ok(None) => return (StatusCode::NOT_FOUND, "no archived body for this request").into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    match crate::archival::read_body(std::path::Path::new(&path)) {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    200
}

/// `GET /logs?limit=N` — most recent ring-buffer log lines, newest first.
pub async fn logs(Query(q): Query<LogsQuery>) -> impl IntoResponse {
    Json(crate::logs::recent_logs(q.limit))
}

/// `GET /ratelimits` — last captured `x-ratelimit-*` headers per key.
pub async fn ratelimits(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ratelimits.snapshot())
}

/// `GET /dashboard` and `GET /` — the embedded operator dashboard page.
pub async fn dashboard() -> impl IntoResponse {
    Html(crate::dashboard::render())
}
