//! # Mergex Core
//!
//! Engine library for the mergex auto-merge controller: a per-repository
//! serialization and retry engine that drives eligible pull requests to a
//! merged state.
//!
//! ## Overview
//!
//! Webhook deliveries are reduced to `(installation, owner, repo, number)`
//! identities and enqueued into Redis-backed per-repo queues with a dedupe
//! set, deferred re-delivery, and a dead-letter list. A drain task per
//! repo claims a TTL'd lease, honors per-installation rate-limit
//! backpressure, and runs each item through the merge state machine:
//! load repo config, evaluate mergeability, optionally update the branch
//! and poll checks, then merge.
//!
//! ## Architecture
//!
//! - [`store`]: the external-store seam (Redis in production)
//! - [`queue`] / [`lease`] / [`throttle`]: the serialized per-repo state
//! - [`github`]: installation-token REST client behind a trait
//! - [`worker`]: the drain loop and merge state machine
//! - [`metrics`]: Prometheus instrumentation for all of the above

/// Shared engine context handed to drains and the ingress.
pub mod context;

/// Error types and handling.
pub mod error;

/// GitHub REST client and its trait seam.
pub mod github;

/// Per-repo worker lease.
pub mod lease;

/// Prometheus metrics.
pub mod metrics;

/// Wire and domain models.
pub mod models;

/// Per-repo work queue with dedupe and dead-lettering.
pub mod queue;

/// Environment-provided settings.
pub mod settings;

/// External store abstraction.
pub mod store;

/// Per-installation backpressure marker.
pub mod throttle;

/// Small shared helpers.
pub mod util;

/// Drain loop and merge state machine.
pub mod worker;

pub use context::EngineContext;
pub use error::{CoreError, Result};
pub use settings::Settings;
