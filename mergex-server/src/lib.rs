//! # Mergex Server
//!
//! Webhook ingress and process bootstrap for the mergex auto-merge
//! controller.
//!
//! ## Overview
//!
//! The server accepts GitHub webhook deliveries, verifies their HMAC
//! signatures, reduces them to pull-request identities, and feeds the
//! per-repository queues in `mergex-core`. A drain task is spawned for
//! every touched repo; serialization, retries, backpressure, and the
//! merge decision itself all live in the core engine.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - Redis (through `mergex-core`) for queues, leases, and throttles
//! - The GitHub REST API for pull-request facts and mutations
//! - Prometheus text exposition on `/metrics`

/// Route assembly
pub mod routes;

/// Liveness, readiness, metrics, and queue status handlers
pub mod handlers;

/// Application state shared by all handlers
pub mod state;

/// Webhook verification and identity extraction
pub mod webhook;

pub use routes::create_router;
pub use state::AppState;
