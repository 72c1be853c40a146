//! Per-repository drain worker.
//!
//! One drain runs per webhook-touched repo: it claims the repo lease,
//! honors installation backpressure, pops queued items through the merge
//! state machine, and applies the retry / dead-letter / starvation policy.
//! The lease is the only cross-process mutual exclusion; everything else
//! is idempotent enough to tolerate at-least-once delivery.

pub mod merge;
pub mod repo_config;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::EngineContext;
use crate::lease::LeaseManager;
use crate::metrics;
use crate::util::epoch_seconds;
use self::merge::ItemOutcome;

/// Lease keep-alive handle passed into long-running state-machine phases.
///
/// `beat` returning false means the lease is gone and the caller must stop
/// without further forge mutations.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    lease: LeaseManager,
    worker_id: String,
}

impl Heartbeat {
    pub fn new(lease: LeaseManager, worker_id: &str) -> Self {
        Self {
            lease,
            worker_id: worker_id.to_string(),
        }
    }

    /// Refresh the lease; false when ownership lapsed.
    pub async fn beat(&self) -> bool {
        self.lease.refresh(&self.worker_id).await
    }
}

/// Transient failures retry with backoff until the retry budget runs out;
/// everything else consumes the item.
pub fn is_transient(reason: &str) -> bool {
    reason.starts_with("checks_timeout")
        || reason.contains("checks_not_green")
        || reason.starts_with("failed_to_fetch")
        || reason.starts_with("update_branch_failed")
        || reason.starts_with("not_mergeable_after_update")
        || reason == "merge_api_error"
        || reason.starts_with("uncaught_error")
}

/// Spawn a drain task for one repository.
pub fn spawn_drain(ctx: Arc<EngineContext>, installation_id: u64, owner: &str, repo: &str) {
    let owner = owner.to_string();
    let repo = repo.to_string();
    tokio::spawn(async move {
        run_drain(ctx, installation_id, owner, repo).await;
    });
}

async fn run_drain(ctx: Arc<EngineContext>, installation_id: u64, owner: String, repo: String) {
    let worker_id = Uuid::new_v4().to_string();
    let lease = ctx.lease(installation_id, &owner, &repo);
    debug!(%owner, %repo, installation_id, %worker_id, "drain start");

    match lease.acquire(&worker_id).await {
        Ok(true) => {}
        Ok(false) => {
            // Another worker owns the repo; it will drain.
            debug!(%owner, %repo, "drain skipped: lease held elsewhere");
            return;
        }
        Err(e) => {
            warn!(%owner, %repo, "drain skipped: lease acquire failed: {e}");
            return;
        }
    }

    drain_queue(&ctx, installation_id, &owner, &repo, &lease, &worker_id).await;

    lease.release(&worker_id).await;
    debug!(%owner, %repo, %worker_id, "drain finished");
}

async fn drain_queue(
    ctx: &Arc<EngineContext>,
    installation_id: u64,
    owner: &str,
    repo: &str,
    lease: &LeaseManager,
    worker_id: &str,
) {
    let throttle = ctx.throttle(installation_id);
    if let Some(marker) = throttle.get().await {
        let now = epoch_seconds();
        if marker.until > now {
            let delay = (marker.until - now).min(ctx.settings.max_backoff_seconds as f64);
            if delay > 0.0 {
                debug!(
                    installation_id,
                    delay_seconds = delay,
                    reason = %marker.reason,
                    "backpressure active; deferring drain"
                );
                schedule_drain(
                    Arc::clone(ctx),
                    installation_id,
                    owner.to_string(),
                    repo.to_string(),
                    Duration::from_secs_f64(delay),
                );
            }
            // Do not hold the lease while waiting out the throttle.
            return;
        }
    }

    let queue = ctx.queue(installation_id, owner, repo);
    let gh = ctx.github.client(installation_id);
    loop {
        let item = match queue.pop().await {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(owner, repo, "queue empty; stopping drain");
                break;
            }
            Err(e) => {
                warn!(owner, repo, "queue pop failed: {e}");
                break;
            }
        };

        debug!(owner, repo, number = item.number, "processing queued PR");
        let heartbeat = Heartbeat::new(lease.clone(), worker_id);
        let started = Instant::now();
        let outcome = merge::process_item(gh.as_ref(), owner, repo, item.number, &heartbeat).await;
        let elapsed = started.elapsed();

        match outcome {
            ItemOutcome::Success => {
                debug!(owner, repo, number = item.number, "item complete");
            }
            ItemOutcome::LeaseLost => {
                metrics::WORKER_LOCK_LOST
                    .with_label_values(&[owner, repo])
                    .inc();
                // Requeue touches only the store, never the forge.
                queue.requeue_tail(&item).await;
                debug!(owner, repo, "lease lost mid-item; stopping drain");
                return;
            }
            ItemOutcome::Failed(reason) => {
                if elapsed.as_secs() > ctx.settings.max_item_window_seconds {
                    // Item hogged the repo; give others a turn without
                    // charging a retry.
                    metrics::QUEUE_STARVATION
                        .with_label_values(&[owner, repo])
                        .inc();
                    queue.requeue_tail(&item).await;
                } else if is_transient(&reason) {
                    if item.retries + 1 >= ctx.settings.max_retries {
                        warn!(
                            owner,
                            repo,
                            number = item.number,
                            retries = item.retries,
                            %reason,
                            "retries exhausted; dead-lettering"
                        );
                        queue.send_to_dead_letter(&item).await;
                    } else {
                        debug!(owner, repo, number = item.number, %reason, "requeueing with backoff");
                        queue.requeue_with_backoff(item).await;
                    }
                } else {
                    debug!(owner, repo, number = item.number, %reason, "permanent failure; item dropped");
                }
            }
        }

        tokio::task::yield_now().await;
        if !lease.refresh(worker_id).await {
            metrics::WORKER_LOCK_LOST
                .with_label_values(&[owner, repo])
                .inc();
            debug!(owner, repo, "lost lease while draining; stopping");
            break;
        }
    }
}

/// Re-invoke the drain after a delay, used when a throttle defers work.
/// A real timer rather than a detached sleep: throttled repos resume even
/// with no further webhook traffic.
fn schedule_drain(
    ctx: Arc<EngineContext>,
    installation_id: u64,
    owner: String,
    repo: String,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        spawn_drain(ctx, installation_id, &owner, &repo);
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Recording double for the GitHub API, shaped per test by builders.

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::github::{GithubApi, GithubError, GithubFactory};
    use crate::models::{CheckSuite, CombinedStatus, MergeMethod, PullRequest};
    use std::sync::Arc;

    pub(crate) struct FakeGithub {
        number: u64,
        missing: bool,
        labels: Vec<String>,
        draft: bool,
        locked: bool,
        mergeable: Option<bool>,
        state: Mutex<String>,
        flip_on_update: bool,
        combined: CombinedStatus,
        suites: Vec<CheckSuite>,
        config: Option<String>,
        update_ok: bool,
        merge_ok: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeGithub {
        pub fn mergeable_pr(number: u64) -> Self {
            Self {
                number,
                missing: false,
                labels: vec!["automerge".to_string()],
                draft: false,
                locked: false,
                mergeable: Some(true),
                state: Mutex::new("clean".to_string()),
                flip_on_update: false,
                combined: CombinedStatus {
                    state: "success".to_string(),
                    statuses: Vec::new(),
                },
                suites: Vec::new(),
                config: None,
                update_ok: true,
                merge_ok: true,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn missing_pr() -> Self {
            Self {
                missing: true,
                ..Self::mergeable_pr(0)
            }
        }

        pub fn without_labels(mut self) -> Self {
            self.labels.clear();
            self
        }

        pub fn drafted(mut self) -> Self {
            self.draft = true;
            self
        }

        pub fn locked(mut self) -> Self {
            self.locked = true;
            self
        }

        pub fn mergeable_flag(mut self, mergeable: bool) -> Self {
            self.mergeable = Some(mergeable);
            self
        }

        pub fn behind_until_updated(self) -> Self {
            *self.state.lock().unwrap() = "behind".to_string();
            Self {
                flip_on_update: true,
                ..self
            }
        }

        pub fn with_config(mut self, yaml: &str) -> Self {
            self.config = Some(yaml.to_string());
            self
        }

        pub fn with_combined(mut self, state: &str, statuses: &[&str]) -> Self {
            self.combined = CombinedStatus {
                state: state.to_string(),
                statuses: statuses
                    .iter()
                    .map(|s| {
                        serde_json::from_value(serde_json::json!({
                            "context": "ci",
                            "state": s,
                        }))
                        .unwrap()
                    })
                    .collect(),
            };
            self
        }

        pub fn with_suites(mut self, conclusions: &[&str]) -> Self {
            self.suites = conclusions
                .iter()
                .map(|c| CheckSuite {
                    conclusion: Some(c.to_string()),
                })
                .collect();
            self
        }

        pub fn update_branch_fails(mut self) -> Self {
            self.update_ok = false;
            self
        }

        pub fn merge_fails(mut self) -> Self {
            self.merge_ok = false;
            self
        }

        pub fn saw_merge(&self) -> bool {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.starts_with("merge:"))
        }

        pub fn saw_merge_with(&self, method: MergeMethod) -> bool {
            self.calls
                .lock()
                .unwrap()
                .contains(&format!("merge:{method}"))
        }

        pub fn saw_update_branch(&self) -> bool {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| c == "update_branch")
        }

        pub fn merge_count(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with("merge:"))
                .count()
        }

        fn current_pr(&self) -> PullRequest {
            serde_json::from_value(serde_json::json!({
                "number": self.number,
                "title": "feat: change",
                "body": "details",
                "draft": self.draft,
                "locked": self.locked,
                "labels": self.labels.iter()
                    .map(|l| serde_json::json!({"name": l}))
                    .collect::<Vec<_>>(),
                "mergeable": self.mergeable,
                "mergeable_state": *self.state.lock().unwrap(),
                "head": {"sha": "abc", "ref": "feature"},
                "base": {"ref": "main"},
                "user": {"login": "dev"},
            }))
            .unwrap()
        }
    }

    #[async_trait]
    impl GithubApi for FakeGithub {
        async fn list_prs_for_commit(
            &self,
            _owner: &str,
            _repo: &str,
            _sha: &str,
        ) -> Result<Vec<PullRequest>, GithubError> {
            Ok(Vec::new())
        }

        async fn get_pr(
            &self,
            _owner: &str,
            _repo: &str,
            _number: u64,
        ) -> Result<Option<PullRequest>, GithubError> {
            if self.missing {
                return Ok(None);
            }
            Ok(Some(self.current_pr()))
        }

        async fn get_combined_status(
            &self,
            _owner: &str,
            _repo: &str,
            _sha: &str,
        ) -> Result<CombinedStatus, GithubError> {
            Ok(self.combined.clone())
        }

        async fn list_check_suites(
            &self,
            _owner: &str,
            _repo: &str,
            _sha: &str,
        ) -> Result<Vec<CheckSuite>, GithubError> {
            Ok(self.suites.clone())
        }

        async fn update_branch(
            &self,
            _owner: &str,
            _repo: &str,
            _number: u64,
        ) -> Result<bool, GithubError> {
            self.calls.lock().unwrap().push("update_branch".to_string());
            if self.update_ok && self.flip_on_update {
                *self.state.lock().unwrap() = "clean".to_string();
            }
            Ok(self.update_ok)
        }

        async fn merge_pr(
            &self,
            _owner: &str,
            _repo: &str,
            number: u64,
            method: MergeMethod,
            _title: &str,
            _body: &str,
        ) -> Result<(bool, String), GithubError> {
            self.calls.lock().unwrap().push(format!("merge:{method}"));
            if self.merge_ok {
                Ok((true, format!("Merged PR #{number} via {method}")))
            } else {
                Ok((false, format!("Merge failed for PR #{number}: 405")))
            }
        }

        async fn load_repo_file(
            &self,
            _owner: &str,
            _repo: &str,
            _path: &str,
        ) -> Result<Option<String>, GithubError> {
            Ok(self.config.clone())
        }
    }

    pub(crate) struct FakeFactory {
        pub gh: Arc<FakeGithub>,
    }

    impl GithubFactory for FakeFactory {
        fn client(&self, _installation_id: u64) -> Arc<dyn GithubApi> {
            Arc::clone(&self.gh) as Arc<dyn GithubApi>
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::test_support::{FakeFactory, FakeGithub};
    use super::*;
    use crate::context::EngineContext;
    use crate::settings::Settings;
    use crate::store::{MemoryStore, Store};

    pub(crate) async fn heartbeat() -> (Heartbeat, LeaseManager) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let lease = LeaseManager::new(store, Arc::new(Settings::default()), 1, "octo", "repo");
        assert!(lease.acquire("hb-worker").await.unwrap());
        (Heartbeat::new(lease.clone(), "hb-worker"), lease)
    }

    fn context(gh: FakeGithub, settings: Settings) -> (Arc<EngineContext>, Arc<FakeGithub>) {
        let gh = Arc::new(gh);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ctx = EngineContext::with_github(
            Arc::new(settings),
            store,
            Arc::new(FakeFactory { gh: Arc::clone(&gh) }),
        );
        (Arc::new(ctx), gh)
    }

    fn dlq_key(ctx: &EngineContext) -> String {
        ctx.settings.redis_key(&["dlq", "1", "octo/repo"])
    }

    #[test]
    fn transient_reasons_are_classified() {
        for reason in [
            "checks_timeout",
            "checks_not_green",
            "not_mergeable_after_update:checks_not_green",
            "failed_to_fetch",
            "failed_to_fetch:head_sha",
            "update_branch_failed:behind_or_blocked:behind",
            "merge_api_error",
            "uncaught_error:boom",
        ] {
            assert!(is_transient(reason), "{reason} should be transient");
        }
        for reason in [
            "draft",
            "locked",
            "missing_label",
            "mergeable_false:dirty",
            "behind_or_blocked:blocked",
        ] {
            assert!(!is_transient(reason), "{reason} should be permanent");
        }
    }

    #[tokio::test]
    async fn drain_processes_queue_to_empty_and_releases_lease() {
        let (ctx, gh) = context(
            FakeGithub::mergeable_pr(6).with_suites(&["success"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(6, Some("u1"), 0, 0.0).await.unwrap();

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        assert_eq!(gh.merge_count(), 1);
        assert_eq!(queue.depth().await, 0);
        // Lease released: a fresh worker can claim the repo.
        let lease = ctx.lease(1, "octo", "repo");
        assert!(lease.acquire("next-worker").await.unwrap());
    }

    #[tokio::test]
    async fn dedupe_yields_exactly_one_merge_attempt() {
        let (ctx, gh) = context(
            FakeGithub::mergeable_pr(6).with_suites(&["success"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        // Two deliveries for the same head SHA resolve to the same PR.
        queue.enqueue(6, Some("ci"), 0, 0.0).await.unwrap();
        queue.enqueue(6, Some("ci"), 0, 0.0).await.unwrap();
        assert_eq!(queue.depth().await, 1);

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        assert_eq!(gh.merge_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_requeues_with_backoff() {
        let (ctx, _gh) = context(
            FakeGithub::mergeable_pr(4)
                .with_combined("success", &["success"])
                .with_suites(&["failure"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(4, None, 0, 0.0).await.unwrap();

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        // Requeued (deferred), not dead-lettered.
        assert_eq!(queue.depth().await, 1);
        assert_eq!(ctx.store.list_len(&dlq_key(&ctx)).await.unwrap(), 0);
        assert_eq!(queue.find_position(4).await, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_the_dead_letter_queue() {
        let settings = Settings {
            max_retries: 1,
            ..Settings::default()
        };
        let (ctx, _gh) = context(
            FakeGithub::mergeable_pr(4)
                .with_combined("success", &["success"])
                .with_suites(&["failure"]),
            settings,
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(4, None, 0, 0.0).await.unwrap();

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        assert_eq!(queue.depth().await, 0);
        assert_eq!(ctx.store.list_len(&dlq_key(&ctx)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_drops_item_without_requeue() {
        let (ctx, gh) = context(FakeGithub::mergeable_pr(5).drafted(), Settings::default());
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(5, None, 0, 0.0).await.unwrap();

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        assert!(!gh.saw_merge());
        assert_eq!(queue.depth().await, 0);
        assert_eq!(ctx.store.list_len(&dlq_key(&ctx)).await.unwrap(), 0);
        // Consumed for good: the same PR can be enqueued again later.
        assert_eq!(queue.find_position(5).await, 0);
    }

    #[tokio::test]
    async fn active_throttle_defers_drain_and_releases_lease() {
        let (ctx, gh) = context(
            FakeGithub::mergeable_pr(6).with_suites(&["success"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(6, None, 0, 0.0).await.unwrap();
        ctx.throttle(1)
            .set(crate::util::epoch_seconds() + 60.0, "retry_after")
            .await;

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        // Nothing processed while throttled; item still queued, lease free.
        assert!(!gh.saw_merge());
        assert_eq!(queue.depth().await, 1);
        let lease = ctx.lease(1, "octo", "repo");
        assert!(lease.acquire("next-worker").await.unwrap());
    }

    #[tokio::test]
    async fn expired_throttle_does_not_block_drain() {
        let (ctx, gh) = context(
            FakeGithub::mergeable_pr(6).with_suites(&["success"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(6, None, 0, 0.0).await.unwrap();
        // Marker whose deadline already passed (TTL floors at 1s).
        ctx.throttle(1)
            .set(crate::util::epoch_seconds() - 10.0, "primary")
            .await;

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        assert_eq!(gh.merge_count(), 1);
    }

    #[tokio::test]
    async fn second_drain_skips_while_lease_is_held() {
        let (ctx, gh) = context(
            FakeGithub::mergeable_pr(6).with_suites(&["success"]),
            Settings::default(),
        );
        let queue = ctx.queue(1, "octo", "repo");
        queue.enqueue(6, None, 0, 0.0).await.unwrap();

        let lease = ctx.lease(1, "octo", "repo");
        assert!(lease.acquire("other-worker").await.unwrap());

        run_drain(Arc::clone(&ctx), 1, "octo".to_string(), "repo".to_string()).await;

        // Drain bowed out: item untouched, no merge issued.
        assert!(!gh.saw_merge());
        assert_eq!(queue.depth().await, 1);
    }
}
