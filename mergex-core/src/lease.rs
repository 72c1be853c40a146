//! Per-repository worker lease.
//!
//! A TTL'd key holding the owning worker's id. Presence means some worker
//! claims the repo; refresh and release only act when the stored owner
//! matches, so a worker that lost its lease cannot stomp a successor.

use std::sync::Arc;

use tracing::debug;

use crate::metrics;
use crate::settings::Settings;
use crate::store::{Store, StoreError};

/// Server-side scripts for owner-conditional lease updates.
mod scripts {
    /// Extend the TTL only while the caller still owns the lease.
    pub const REFRESH: &str = r#"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('expire', KEYS[1], ARGV[2])
        else
            return 0
        end
    "#;

    /// Delete the lease only while the caller still owns it.
    pub const RELEASE: &str = r#"
        if redis.call('get', KEYS[1]) == ARGV[1] then
            return redis.call('del', KEYS[1])
        else
            return 0
        end
    "#;
}

/// Handle to one repository's lease.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    owner: String,
    repo: String,
    lock_key: String,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn Store>,
        settings: Arc<Settings>,
        installation_id: u64,
        owner: &str,
        repo: &str,
    ) -> Self {
        let lock_key = settings.redis_key(&[
            "lock",
            &installation_id.to_string(),
            &format!("{owner}/{repo}"),
        ]);
        Self {
            store,
            settings,
            owner: owner.to_string(),
            repo: repo.to_string(),
            lock_key,
        }
    }

    fn labels(&self) -> [&str; 2] {
        [self.owner.as_str(), self.repo.as_str()]
    }

    /// Claim the repo for `worker_id`. False when anyone holds it,
    /// including this worker: every drain uses a fresh id.
    pub async fn acquire(&self, worker_id: &str) -> Result<bool, StoreError> {
        let acquired = self
            .store
            .kv_set_if_absent(
                &self.lock_key,
                worker_id,
                self.settings.redis_lock_ttl_seconds,
            )
            .await?;
        if acquired {
            metrics::WORKER_LOCK_ACQUIRED
                .with_label_values(&self.labels())
                .inc();
            metrics::WORKER_ACTIVE.with_label_values(&self.labels()).set(1.0);
        } else {
            metrics::WORKER_LOCK_FAILED
                .with_label_values(&self.labels())
                .inc();
        }
        Ok(acquired)
    }

    /// Extend the TTL iff this worker still owns the lease.
    ///
    /// Any store failure reads as "lost": the caller must stop processing
    /// rather than risk running unleased.
    pub async fn refresh(&self, worker_id: &str) -> bool {
        let ttl = self.settings.redis_lock_ttl_seconds.to_string();
        match self
            .store
            .script(scripts::REFRESH, &[&self.lock_key], &[worker_id, &ttl])
            .await
        {
            Ok(res) => res == 1,
            Err(e) => {
                debug!(key = %self.lock_key, "lease refresh failed: {e}");
                false
            }
        }
    }

    /// Delete the lease iff this worker still owns it; silent otherwise.
    pub async fn release(&self, worker_id: &str) {
        if let Err(e) = self
            .store
            .script(scripts::RELEASE, &[&self.lock_key], &[worker_id])
            .await
        {
            debug!(key = %self.lock_key, "lease release failed: {e}");
        }
        metrics::WORKER_ACTIVE.with_label_values(&self.labels()).set(0.0);
    }
}
