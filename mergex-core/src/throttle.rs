//! Per-installation backpressure marker.
//!
//! Set by the GitHub client when a response signals rate limiting; honored
//! by every drain for that installation until the marker expires.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics;
use crate::settings::Settings;
use crate::store::Store;
use crate::util::epoch_seconds;

/// Stored marker: pause all workers for the installation until `until`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleMarker {
    /// Wall-clock seconds when processing may resume.
    pub until: f64,
    /// Advisory classification: primary, secondary, or retry_after.
    pub reason: String,
}

/// Handle to one installation's throttle marker.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    store: Arc<dyn Store>,
    installation: String,
    key: String,
}

impl ThrottleGate {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>, installation_id: u64) -> Self {
        let installation = installation_id.to_string();
        Self {
            key: settings.redis_key(&["throttle", &installation]),
            installation,
            store,
        }
    }

    /// Write the marker with a TTL of `max(1, until - now)` seconds,
    /// overwriting any existing value. Best effort: a store failure is
    /// logged and the request that triggered it proceeds.
    pub async fn set(&self, until: f64, reason: &str) {
        let ttl = (until - epoch_seconds()).ceil().max(1.0) as u64;
        let marker = ThrottleMarker {
            until,
            reason: reason.to_string(),
        };
        let Ok(payload) = serde_json::to_string(&marker) else {
            return;
        };
        debug!(
            installation = %self.installation,
            until,
            ttl,
            reason,
            "setting throttle"
        );
        match self.store.kv_set_with_ttl(&self.key, &payload, ttl).await {
            Ok(()) => {
                metrics::BACKPRESSURE_ACTIVE
                    .with_label_values(&[&self.installation])
                    .set(1.0);
            }
            Err(e) => debug!("failed to set throttle: {e}"),
        }
    }

    /// Read the current marker, if any, and keep the gauge in sync.
    pub async fn get(&self) -> Option<ThrottleMarker> {
        let raw = match self.store.kv_get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::BACKPRESSURE_ACTIVE
                    .with_label_values(&[&self.installation])
                    .set(0.0);
                return None;
            }
            Err(_) => return None,
        };
        match serde_json::from_str::<ThrottleMarker>(&raw) {
            Ok(marker) => {
                metrics::BACKPRESSURE_ACTIVE
                    .with_label_values(&[&self.installation])
                    .set(1.0);
                Some(marker)
            }
            Err(_) => None,
        }
    }

    /// Drop the marker.
    pub async fn clear(&self) {
        let _ = self.store.kv_delete(&self.key).await;
        metrics::BACKPRESSURE_ACTIVE
            .with_label_values(&[&self.installation])
            .set(0.0);
    }
}
