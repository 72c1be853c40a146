//! External store abstraction.
//!
//! The engine keeps all shared state (queues, leases, throttles) in an
//! external key/value + list store. [`Store`] is the thin seam over it:
//! [`RedisStore`] is the production implementation, [`MemoryStore`] the
//! in-process one used by tests and local development.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Store-level failure; callers count these and degrade rather than crash.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Primitive operations the engine needs from the external store.
///
/// All operations are synchronous from the caller's viewpoint: when a call
/// returns, the mutation is applied (or an error is surfaced).
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Append a value to the tail of a list.
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Pop the head of a list, if any.
    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Current length of a list; 0 for a missing key.
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Read a list element by index without consuming it.
    async fn list_peek(&self, key: &str, index: isize) -> Result<Option<String>, StoreError>;

    /// Read a bounded inclusive range of a list.
    async fn list_range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError>;

    /// Add a member to a set; true iff it was newly added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Membership test.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Remove a member from a set.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// SET-if-absent with a TTL; true iff the key was set.
    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError>;

    /// Unconditional SET with a TTL, overwriting any existing value.
    async fn kv_set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), StoreError>;

    /// Read a key, honoring expiry.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a key.
    async fn kv_delete(&self, key: &str) -> Result<(), StoreError>;

    /// Set a hash field only if it is absent.
    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Set a hash field unconditionally.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Delete a hash field.
    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<(), StoreError>;

    /// Run a server-side script for atomic compare-and-act updates.
    ///
    /// Used by the lease manager to refresh or release the lock only when
    /// the stored owner matches. Returns the script's integer reply.
    async fn script(
        &self,
        body: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<i64, StoreError>;

    /// Enqueue batch: list push + dedupe-set add + first-ts hash init,
    /// applied in a single round-trip. Either all three mutations are
    /// observable afterwards or none are.
    async fn enqueue_batch(
        &self,
        queue_key: &str,
        payload: &str,
        dedupe_key: &str,
        member: &str,
        meta_key: &str,
        first_ts: &str,
    ) -> Result<(), StoreError>;

    /// Requeue batch: list push + dedupe-set re-add in a single round-trip.
    async fn requeue_batch(
        &self,
        queue_key: &str,
        payload: &str,
        dedupe_key: &str,
        member: &str,
    ) -> Result<(), StoreError>;
}
