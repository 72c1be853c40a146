//! Redis-backed [`Store`] implementation.

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::{Store, StoreError};
use crate::metrics::REDIS_LATENCY_SECONDS;

/// Store adapter over a Redis connection manager.
///
/// The connection manager multiplexes and reconnects internally, so clones
/// are cheap and safe to use from many tasks.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis and build the adapter.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to Redis at {}", redis_url);

        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        info!("Successfully connected to Redis");

        Ok(Self { conn })
    }

    fn observe(op: &str, start: Instant) {
        REDIS_LATENCY_SECONDS
            .with_label_values(&[op])
            .observe(start.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.rpush::<_, _, ()>(key, value).await;
        Self::observe("rpush", start);
        Ok(res?)
    }

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.lpop::<_, Option<String>>(key, None).await;
        Self::observe("lpop", start);
        Ok(res?)
    }

    async fn list_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.llen::<_, u64>(key).await;
        Self::observe("llen", start);
        Ok(res?)
    }

    async fn list_peek(&self, key: &str, index: isize) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.lindex::<_, Option<String>>(key, index).await;
        Self::observe("lindex", start);
        Ok(res?)
    }

    async fn list_range(
        &self,
        key: &str,
        start_index: isize,
        stop_index: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn
            .lrange::<_, Vec<String>>(key, start_index, stop_index)
            .await;
        Self::observe("lrange", start);
        Ok(res?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.sadd::<_, _, i64>(key, member).await;
        Self::observe("sadd", start);
        Ok(res? == 1)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.sismember::<_, _, bool>(key, member).await;
        Self::observe("sismember", start);
        Ok(res?)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.srem::<_, _, ()>(key, member).await;
        Self::observe("srem", start);
        Ok(res?)
    }

    async fn kv_set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<Option<String>>(&mut conn)
            .await;
        Self::observe("set_nx", start);
        Ok(res?.is_some())
    }

    async fn kv_set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.set_ex::<_, _, ()>(key, value, ttl_seconds).await;
        Self::observe("set_ex", start);
        Ok(res?)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.get::<_, Option<String>>(key).await;
        Self::observe("get", start);
        Ok(res?)
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.del::<_, ()>(key).await;
        Self::observe("del", start);
        Ok(res?)
    }

    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.hset_nx::<_, _, _, ()>(key, field, value).await;
        Self::observe("hsetnx", start);
        Ok(res?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.hset::<_, _, _, ()>(key, field, value).await;
        Self::observe("hset", start);
        Ok(res?)
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = conn.hdel::<_, _, ()>(key, field).await;
        Self::observe("hdel", start);
        Ok(res?)
    }

    async fn script(
        &self,
        body: &str,
        keys: &[&str],
        args: &[&str],
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(body);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        let start = Instant::now();
        let res = invocation.invoke_async::<i64>(&mut conn).await;
        Self::observe("eval", start);
        Ok(res?)
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
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = redis::pipe()
            .rpush(queue_key, payload)
            .ignore()
            .sadd(dedupe_key, member)
            .ignore()
            .hset_nx(meta_key, "first_ts", first_ts)
            .ignore()
            .query_async::<()>(&mut conn)
            .await;
        Self::observe("enqueue", start);
        debug!(queue_key, member, "enqueued item");
        Ok(res?)
    }

    async fn requeue_batch(
        &self,
        queue_key: &str,
        payload: &str,
        dedupe_key: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        let res = redis::pipe()
            .rpush(queue_key, payload)
            .ignore()
            .sadd(dedupe_key, member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await;
        Self::observe("requeue", start);
        Ok(res?)
    }
}
