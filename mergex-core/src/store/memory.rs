//! In-process [`Store`] implementation.
//!
//! Mirrors the Redis semantics the engine relies on, including TTL expiry
//! and the owner-conditional lease scripts. Backs the test suites and is
//! handy for single-process local runs without a Redis instance.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Store, StoreError};

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Option<Instant>,
}

impl Expiring {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Instant::now())
    }
}

#[derive(Debug, Default)]
struct Inner {
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    kv: HashMap<String, Expiring>,
    hashes: HashMap<String, HashMap<String, String>>,
}

impl Inner {
    /// Drop an expired key before any read or conditional write touches it.
    fn prune(&mut self, key: &str) {
        if let Some(entry) = self.kv.get(key)
            && !entry.live()
        {
            self.kv.remove(key);
        }
    }
}

/// Test and local-development store with Redis-compatible behavior.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        Ok(())
    }

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .lists
            .get_mut(key)
            .and_then(|list| list.pop_front()))
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        Ok(self.lock().lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn list_peek(&self, key: &str, index: isize) -> Result<Option<String>, StoreError> {
        let guard = self.lock();
        let Some(list) = guard.lists.get(key) else {
            return Ok(None);
        };
        let index = if index < 0 {
            let Some(i) = list.len().checked_sub(index.unsigned_abs()) else {
                return Ok(None);
            };
            i
        } else {
            index as usize
        };
        Ok(list.get(index).cloned())
    }

    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let guard = self.lock();
        let Some(list) = guard.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let clamp = |i: isize| -> usize {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len) as usize
        };
        let (start, stop) = (clamp(start), clamp(stop).min(list.len().saturating_sub(1)));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(start).take(stop - start + 1).cloned().collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(set) = self.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let mut guard = self.lock();
        guard.prune(key);
        if guard.kv.contains_key(key) {
            return Ok(false);
        }
        guard.kv.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(true)
    }

    async fn kv_set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        self.lock().kv.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.lock();
        guard.prune(key);
        Ok(guard.kv.get(key).map(|e| e.value.clone()))
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().kv.remove(key);
        Ok(())
    }

    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert_with(|| value.to_string());
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some(hash) = self.lock().hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    /// Interpret the owner-conditional compare-and-act scripts.
    ///
    /// Supports the two shapes the lease manager uses: compare-then-EXPIRE
    /// (refresh) and compare-then-DEL (release). Anything else is rejected.
    async fn script(
        &self,
        body: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<i64, StoreError> {
        let (Some(key), Some(expected)) = (keys.first(), args.first()) else {
            return Err(StoreError::Unavailable(
                "script requires one key and one argument".to_string(),
            ));
        };
        let mut guard = self.lock();
        guard.prune(key);
        let matches = guard
            .kv
            .get(*key)
            .is_some_and(|entry| entry.value == *expected);
        if !matches {
            return Ok(0);
        }
        if body.contains("'del'") {
            guard.kv.remove(*key);
            Ok(1)
        } else if body.contains("'expire'") {
            let ttl: u64 = args
                .get(1)
                .and_then(|a| a.parse().ok())
                .unwrap_or_default();
            if let Some(entry) = guard.kv.get_mut(*key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl));
            }
            Ok(1)
        } else {
            Err(StoreError::Unavailable(
                "unsupported script body".to_string(),
            ))
        }
    }

    async fn enqueue_batch(
        &self,
        queue_key: &str,
        payload: &str,
        dedupe_key: &str,
        member: &str,
        meta_key: &str,
        first_ts: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard
            .lists
            .entry(queue_key.to_string())
            .or_default()
            .push_back(payload.to_string());
        guard
            .sets
            .entry(dedupe_key.to_string())
            .or_default()
            .insert(member.to_string());
        guard
            .hashes
            .entry(meta_key.to_string())
            .or_default()
            .entry("first_ts".to_string())
            .or_insert_with(|| first_ts.to_string());
        Ok(())
    }

    async fn requeue_batch(
        &self,
        queue_key: &str,
        payload: &str,
        dedupe_key: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut guard = self.lock();
        guard
            .lists
            .entry(queue_key.to_string())
            .or_default()
            .push_back(payload.to_string());
        guard
            .sets
            .entry(dedupe_key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }
}
