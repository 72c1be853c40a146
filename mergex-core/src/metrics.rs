//! Prometheus metric statics for the whole service.
//!
//! Everything registers against the default registry at first touch;
//! `render` produces the text exposition for the `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
    register_gauge_vec, register_histogram, register_histogram_vec, register_int_counter,
    register_int_counter_vec,
};

// Webhook ingress

pub static WEBHOOK_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "webhook_requests_total",
        "Webhook requests received",
        &["event", "action", "code"]
    )
    .unwrap()
});

pub static WEBHOOK_INVALID_SIGNATURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "webhook_invalid_signatures_total",
        "Webhook requests with invalid HMAC signatures"
    )
    .unwrap()
});

pub static WEBHOOK_PARSE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "webhook_parse_failures_total",
        "Webhook payload parse failures",
        &["event"]
    )
    .unwrap()
});

// Queue

pub static EVENTS_ENQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_enqueued_total",
        "Events accepted and enqueued (after dedupe)",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static EVENTS_DEDUPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "events_deduped_total",
        "Events dropped due to in-queue dedupe",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_PUSH_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_push_failures_total",
        "Store push errors",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_POP: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_pop_total",
        "Successful pops for processing",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_POP_EMPTY: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_pop_empty_total",
        "Empty pops (no queue items)",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_DEFERRED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_deferred_total",
        "Pops deferred because the head item is not yet due",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_REQUEUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_requeued_total",
        "Items requeued with backoff after transient failures",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_DEAD_LETTER: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_dead_letter_total",
        "Items sent to the dead-letter queue",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_STARVATION: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "queue_starvation_total",
        "Items requeued to the tail by the starvation guard",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!("queue_depth", "Current queue depth", &["owner", "repo"]).unwrap()
});

pub static QUEUE_OLDEST_AGE_SECONDS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "queue_oldest_age_seconds",
        "Age in seconds of the oldest queued item (0 if empty)",
        &["owner", "repo"]
    )
    .unwrap()
});

// Store and worker

pub static REDIS_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "redis_latency_seconds",
        "Round-trip latency for store operations",
        &["op"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

pub static WORKER_LOCK_ACQUIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "worker_lock_acquired_total",
        "Worker lease acquisitions",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static WORKER_LOCK_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "worker_lock_failed_total",
        "Worker lease acquisition failures",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static WORKER_LOCK_LOST: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "worker_lock_lost_total",
        "Worker lease lost mid-processing",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static WORKER_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "worker_active",
        "1 when a worker holds the lease and is processing; 0 otherwise",
        &["owner", "repo"]
    )
    .unwrap()
});

pub static WORKER_PROCESSING_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "worker_processing_seconds",
        "Worker phase durations",
        &["phase", "owner", "repo"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .unwrap()
});

// GitHub API

pub static GITHUB_API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "github_api_requests_total",
        "Outbound GitHub API requests",
        &["endpoint", "status"]
    )
    .unwrap()
});

pub static GITHUB_API_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "github_api_latency_seconds",
        "Latency of GitHub API requests",
        &["endpoint"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap()
});

pub static GITHUB_RATE_LIMIT_REMAINING: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "github_rate_limit_remaining",
        "GitHub REST API remaining requests",
        &["installation"]
    )
    .unwrap()
});

pub static GITHUB_RATE_LIMIT_RESET: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "github_rate_limit_reset",
        "Epoch seconds when the GitHub rate limit resets",
        &["installation"]
    )
    .unwrap()
});

pub static THROTTLES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "throttles_total",
        "Times the service engaged backpressure due to rate limits",
        &["scope", "reason"]
    )
    .unwrap()
});

pub static BACKPRESSURE_ACTIVE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "backpressure_active",
        "1 when backpressure is active for an installation",
        &["installation"]
    )
    .unwrap()
});

pub static CONFIG_LOAD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "config_load_failures_total",
        "Failures to load repository configuration"
    )
    .unwrap()
});

// Merge behavior

pub static BRANCH_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "branch_updates_total",
        "Attempted update-branch outcomes",
        &["result"]
    )
    .unwrap()
});

pub static CHECKS_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "checks_wait_seconds",
        "Time spent waiting for checks to pass after a branch update",
        vec![5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 3600.0]
    )
    .unwrap()
});

pub static MERGE_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "merge_attempts_total",
        "Merge attempts by method and result",
        &["method", "result"]
    )
    .unwrap()
});

pub static MERGES_SUCCESS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "merges_success_total",
        "Successful merges by method",
        &["method"]
    )
    .unwrap()
});

pub static MERGES_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "merges_failed_total",
        "Failed merges by reason",
        &["reason"]
    )
    .unwrap()
});

pub static SERVICE_INFO: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "service_info",
        "Service build/version info labeled on 1",
        &["version"]
    )
    .unwrap()
});

/// Render the default registry in the Prometheus text format.
pub fn render() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {e}");
    }
    (encoder.format_type().to_string(), buffer)
}
