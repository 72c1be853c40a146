//! Liveness, readiness, metrics exposition, and queue status.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use mergex_core::metrics;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::state::AppState;

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": state.ctx.settings.service_version,
    }))
}

pub async fn readyz() -> Json<Value> {
    Json(json!({"status": "ready"}))
}

pub async fn metrics_handler() -> Response {
    let (content_type, body) = metrics::render();
    ([(CONTENT_TYPE, content_type)], body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct QueueStatusQuery {
    /// Optional PR number to locate within the queue.
    number: Option<u64>,
}

/// `GET /queue/{installation}/{owner}/{repo}`: depth plus an optional
/// 1-based position lookup (0 when absent or past the bounded window).
pub async fn queue_status(
    State(state): State<AppState>,
    Path((installation_id, owner, repo)): Path<(u64, String, String)>,
    Query(query): Query<QueueStatusQuery>,
) -> Json<Value> {
    let queue = state.ctx.queue(installation_id, &owner, &repo);
    let depth = queue.depth().await;
    let position = match query.number {
        Some(number) => Some(queue.find_position(number).await),
        None => None,
    };
    Json(json!({
        "installation": installation_id,
        "owner": owner,
        "repo": repo,
        "depth": depth,
        "position": position,
    }))
}
