//! Per-repository work queue.
//!
//! Each `(installation, owner, repo)` gets an ordered list of pending
//! pull-request items plus a companion dedupe set, a meta hash holding the
//! first-enqueue timestamp, and an append-only dead-letter list. The dedupe
//! set is a presence index: a PR number appears in the queue at most once.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::metrics;
use crate::models::QueueItem;
use crate::settings::Settings;
use crate::store::{Store, StoreError};
use crate::util::epoch_seconds;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Item appended to the tail.
    Enqueued,
    /// The PR number was already queued; the event was dropped.
    Deduped,
}

/// Handle to one repository's queue.
#[derive(Debug, Clone)]
pub struct RepoQueue {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
    owner: String,
    repo: String,
    queue_key: String,
    dedupe_key: String,
    meta_key: String,
    dlq_key: String,
}

impl RepoQueue {
    pub fn new(
        store: Arc<dyn Store>,
        settings: Arc<Settings>,
        installation_id: u64,
        owner: &str,
        repo: &str,
    ) -> Self {
        let installation = installation_id.to_string();
        let slug = format!("{owner}/{repo}");
        let queue_key = settings.redis_key(&["queue", &installation, &slug]);
        Self {
            meta_key: format!("{queue_key}:meta"),
            dedupe_key: settings.redis_key(&["dedupe", &installation, &slug]),
            dlq_key: settings.redis_key(&["dlq", &installation, &slug]),
            queue_key,
            owner: owner.to_string(),
            repo: repo.to_string(),
            store,
            settings,
        }
    }

    fn labels(&self) -> [&str; 2] {
        [self.owner.as_str(), self.repo.as_str()]
    }

    /// Append a new item unless the PR number is already queued.
    ///
    /// The list push, dedupe-set add, and first-timestamp init are applied
    /// in a single store round-trip; a store failure leaves no partial
    /// state observable.
    pub async fn enqueue(
        &self,
        number: u64,
        sender: Option<&str>,
        retries: u32,
        not_before: f64,
    ) -> Result<EnqueueOutcome, StoreError> {
        let member = number.to_string();
        if self.store.set_contains(&self.dedupe_key, &member).await? {
            metrics::EVENTS_DEDUPED.with_label_values(&self.labels()).inc();
            return Ok(EnqueueOutcome::Deduped);
        }

        let item = QueueItem {
            number,
            sender: sender.map(str::to_string),
            ts: epoch_seconds(),
            retries,
            not_before,
        };
        let payload = serde_json::to_string(&item)
            .map_err(|e| StoreError::Unavailable(format!("item encoding failed: {e}")))?;

        if let Err(e) = self
            .store
            .enqueue_batch(
                &self.queue_key,
                &payload,
                &self.dedupe_key,
                &member,
                &self.meta_key,
                &item.ts.to_string(),
            )
            .await
        {
            metrics::QUEUE_PUSH_FAILURES
                .with_label_values(&self.labels())
                .inc();
            return Err(e);
        }

        metrics::EVENTS_ENQUEUED.with_label_values(&self.labels()).inc();
        self.update_gauges().await;
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Pop the head item for processing.
    ///
    /// A head item whose `not_before` lies in the future is pushed back to
    /// the tail without touching the dedupe set, and this call reports an
    /// empty queue. Corrupt blobs are moved to the dead-letter list rather
    /// than dropped.
    pub async fn pop(&self) -> Result<Option<QueueItem>, StoreError> {
        loop {
            let Some(raw) = self.store.list_pop_head(&self.queue_key).await? else {
                metrics::QUEUE_POP_EMPTY.with_label_values(&self.labels()).inc();
                let _ = self
                    .store
                    .hash_delete_field(&self.meta_key, "first_ts")
                    .await;
                self.update_gauges().await;
                return Ok(None);
            };
            metrics::QUEUE_POP.with_label_values(&self.labels()).inc();

            let item: QueueItem = match serde_json::from_str(&raw) {
                Ok(item) => item,
                Err(e) => {
                    warn!(
                        owner = %self.owner,
                        repo = %self.repo,
                        "dead-lettering undecodable queue item: {e}"
                    );
                    metrics::QUEUE_DEAD_LETTER
                        .with_label_values(&self.labels())
                        .inc();
                    let _ = self.store.list_push_tail(&self.dlq_key, &raw).await;
                    continue;
                }
            };

            if item.not_before > epoch_seconds() {
                if let Err(e) = self.store.list_push_tail(&self.queue_key, &raw).await {
                    warn!("failed to defer item to tail: {e}");
                } else {
                    metrics::QUEUE_DEFERRED.with_label_values(&self.labels()).inc();
                }
                // Dedupe entry stays; the item is still in-queue.
                self.update_gauges().await;
                return Ok(None);
            }

            let _ = self
                .store
                .set_remove(&self.dedupe_key, &item.number.to_string())
                .await;
            self.update_gauges().await;
            return Ok(Some(item));
        }
    }

    /// Requeue a transiently failed item with an exponential delay.
    ///
    /// Bumps `retries` and sets `not_before` to
    /// `now + base * factor^(retries - 1)`, capped at the configured
    /// maximum. If the requeue write fails the item goes to the
    /// dead-letter list instead so it never silently disappears.
    pub async fn requeue_with_backoff(&self, mut item: QueueItem) {
        item.retries += 1;
        let exponent = item.retries.saturating_sub(1).min(64);
        let delay = (self.settings.backoff_base_seconds
            * self.settings.backoff_factor.powi(exponent as i32))
        .min(self.settings.max_backoff_seconds as f64);
        item.not_before = epoch_seconds() + delay;

        let member = item.number.to_string();
        let payload = match serde_json::to_string(&item) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode requeue item: {e}");
                return;
            }
        };
        match self
            .store
            .requeue_batch(&self.queue_key, &payload, &self.dedupe_key, &member)
            .await
        {
            Ok(()) => {
                debug!(
                    number = item.number,
                    retries = item.retries,
                    delay_seconds = delay,
                    "requeued item with backoff"
                );
                metrics::QUEUE_REQUEUED.with_label_values(&self.labels()).inc();
            }
            Err(e) => {
                warn!("requeue failed, dead-lettering item: {e}");
                self.send_to_dead_letter(&item).await;
            }
        }
    }

    /// Requeue to the tail immediately, used by the starvation guard.
    /// Neither `retries` nor `not_before` is touched.
    pub async fn requeue_tail(&self, item: &QueueItem) {
        let member = item.number.to_string();
        let Ok(payload) = serde_json::to_string(item) else {
            return;
        };
        if let Err(e) = self
            .store
            .requeue_batch(&self.queue_key, &payload, &self.dedupe_key, &member)
            .await
        {
            // Best effort; the drain keeps going.
            warn!("tail requeue failed: {e}");
        }
    }

    /// Append an exhausted or unrequeueable item to the dead-letter list.
    pub async fn send_to_dead_letter(&self, item: &QueueItem) {
        let Ok(payload) = serde_json::to_string(item) else {
            return;
        };
        match self.store.list_push_tail(&self.dlq_key, &payload).await {
            Ok(()) => {
                metrics::QUEUE_DEAD_LETTER
                    .with_label_values(&self.labels())
                    .inc();
            }
            Err(e) => {
                // Accepted loss; counted so operators can see it.
                warn!(number = item.number, "dead-letter push failed: {e}");
                metrics::QUEUE_PUSH_FAILURES
                    .with_label_values(&self.labels())
                    .inc();
            }
        }
    }

    /// Current queue length, best effort.
    pub async fn depth(&self) -> u64 {
        self.store.list_len(&self.queue_key).await.unwrap_or(0)
    }

    /// 1-based position of a PR number within the first 1000 items, or 0.
    ///
    /// Bounded with a range read so very large queues stay cheap; items
    /// past the window report 0 even when present.
    pub async fn find_position(&self, number: u64) -> u32 {
        let Ok(items) = self.store.list_range(&self.queue_key, 0, 999).await else {
            return 0;
        };
        for (idx, raw) in items.iter().enumerate() {
            if let Ok(item) = serde_json::from_str::<QueueItem>(raw)
                && item.number == number
            {
                return (idx + 1) as u32;
            }
        }
        0
    }

    /// Recompute the depth and oldest-age gauges from the current head.
    pub async fn update_gauges(&self) {
        let Ok(depth) = self.store.list_len(&self.queue_key).await else {
            return;
        };
        metrics::QUEUE_DEPTH
            .with_label_values(&self.labels())
            .set(depth as f64);
        if depth == 0 {
            let _ = self
                .store
                .hash_delete_field(&self.meta_key, "first_ts")
                .await;
            metrics::QUEUE_OLDEST_AGE_SECONDS
                .with_label_values(&self.labels())
                .set(0.0);
            return;
        }
        let first_ts = match self.store.list_peek(&self.queue_key, 0).await {
            Ok(Some(raw)) => serde_json::from_str::<QueueItem>(&raw).ok().map(|i| i.ts),
            _ => None,
        };
        let now = epoch_seconds();
        let age = first_ts.map_or(0.0, |ts| (now - ts).max(0.0));
        metrics::QUEUE_OLDEST_AGE_SECONDS
            .with_label_values(&self.labels())
            .set(age);
        let _ = self
            .store
            .hash_set(
                &self.meta_key,
                "first_ts",
                &first_ts.unwrap_or(now).to_string(),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn queue() -> RepoQueue {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let settings = Arc::new(Settings {
            redis_namespace: "test-automerge".to_string(),
            ..Settings::default()
        });
        RepoQueue::new(store, settings, 1, "octo", "repo")
    }

    #[tokio::test]
    async fn enqueue_dedupes_and_pops_fifo() {
        let q = queue();

        assert_eq!(
            q.enqueue(5, Some("u1"), 0, 0.0).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            q.enqueue(5, Some("u1"), 0, 0.0).await.unwrap(),
            EnqueueOutcome::Deduped
        );
        assert_eq!(
            q.enqueue(7, Some("u2"), 0, 0.0).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(q.depth().await, 2);

        let first = q.pop().await.unwrap().unwrap();
        let second = q.pop().await.unwrap().unwrap();
        assert_eq!(first.number, 5);
        assert_eq!(second.number, 7);
        assert!(q.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dedupe_clears_after_pop() {
        let q = queue();
        q.enqueue(5, None, 0, 0.0).await.unwrap();
        q.pop().await.unwrap().unwrap();
        // Once popped, the same number can be enqueued again.
        assert_eq!(
            q.enqueue(5, None, 0, 0.0).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
    }

    #[tokio::test]
    async fn pop_defers_future_items_to_tail() {
        let q = queue();
        let future = epoch_seconds() + 3600.0;
        q.enqueue(5, None, 0, future).await.unwrap();
        q.enqueue(7, None, 0, 0.0).await.unwrap();

        // Head is not due: returned empty this call, item moved to tail,
        // dedupe untouched.
        assert!(q.pop().await.unwrap().is_none());
        assert_eq!(q.depth().await, 2);
        assert_eq!(
            q.enqueue(5, None, 0, 0.0).await.unwrap(),
            EnqueueOutcome::Deduped
        );

        // The due item is now at the head.
        let item = q.pop().await.unwrap().unwrap();
        assert_eq!(item.number, 7);
    }

    #[tokio::test]
    async fn requeue_with_backoff_bumps_retries_and_delay() {
        let q = queue();
        q.enqueue(9, None, 0, 0.0).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();

        let before = epoch_seconds();
        q.requeue_with_backoff(item).await;

        // Deferred: pop sees the item but it is not yet due.
        assert!(q.pop().await.unwrap().is_none());
        assert_eq!(q.find_position(9).await, 1);

        let raw = q.store.list_peek(&q.queue_key, 0).await.unwrap().unwrap();
        let requeued: QueueItem = serde_json::from_str(&raw).unwrap();
        assert_eq!(requeued.retries, 1);
        assert!(requeued.not_before >= before + q.settings.backoff_base_seconds);
    }

    #[tokio::test]
    async fn backoff_delay_is_capped() {
        let q = queue();
        q.enqueue(9, None, 10, 0.0).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();

        let before = epoch_seconds();
        q.requeue_with_backoff(item).await;

        let raw = q.store.list_peek(&q.queue_key, 0).await.unwrap().unwrap();
        let requeued: QueueItem = serde_json::from_str(&raw).unwrap();
        assert_eq!(requeued.retries, 11);
        assert!(
            requeued.not_before <= before + q.settings.max_backoff_seconds as f64 + 1.0
        );
    }

    #[tokio::test]
    async fn requeue_tail_preserves_retries() {
        let q = queue();
        q.enqueue(4, None, 2, 0.0).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();

        q.requeue_tail(&item).await;

        let again = q.pop().await.unwrap().unwrap();
        assert_eq!(again.retries, 2);
        assert_eq!(again.not_before, 0.0);
    }

    #[tokio::test]
    async fn find_position_is_one_based_and_bounded() {
        let q = queue();
        for n in 1..=5u64 {
            q.enqueue(n, None, 0, 0.0).await.unwrap();
        }
        assert_eq!(q.find_position(1).await, 1);
        assert_eq!(q.find_position(5).await, 5);
        assert_eq!(q.find_position(99).await, 0);
    }

    #[tokio::test]
    async fn dead_letter_appends_to_dlq() {
        let q = queue();
        q.enqueue(3, None, 0, 0.0).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();

        q.send_to_dead_letter(&item).await;

        assert_eq!(q.store.list_len(&q.dlq_key).await.unwrap(), 1);
        assert_eq!(q.depth().await, 0);
    }

    #[tokio::test]
    async fn pop_round_trips_item() {
        let q = queue();
        q.enqueue(12, Some("octocat"), 0, 0.0).await.unwrap();
        let item = q.pop().await.unwrap().unwrap();
        assert_eq!(item.number, 12);
        assert_eq!(item.sender.as_deref(), Some("octocat"));
        assert_eq!(item.retries, 0);
        assert_eq!(item.not_before, 0.0);
        assert!(item.ts > 0.0);
    }
}
