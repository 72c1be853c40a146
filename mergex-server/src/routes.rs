use axum::{
    Router,
    routing::{get, post},
};

use crate::handlers::{healthz, metrics_handler, queue_status, readyz};
use crate::state::AppState;
use crate::webhook::handle_webhook;

/// Assemble the service router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .route("/queue/{installation}/{owner}/{repo}", get(queue_status))
        .with_state(state)
}
