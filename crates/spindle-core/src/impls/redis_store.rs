//! Redis-backed store.
//!
//! Lists grow on the left: a tail append is `LPUSH` and the head is the
//! rightmost element, so `RPOPLPUSH` moves a head to another list's tail.
//! Guarded transactions run as one Lua script, which Redis executes
//! atomically.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};

use crate::ports::{Command, Guard, Store, StoreError, Transaction};

const TRANSACT_LUA: &str = include_str!("lua/transact.lua");

fn store_error(e: RedisError) -> StoreError {
    if e.code() == Some("WRONGTYPE") {
        StoreError::WrongType(e.to_string())
    } else if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    transact: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Share an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            transact: Script::new(TRANSACT_LUA),
        }
    }

    /// Delete every key under `namespace`. Used by tests and the CLI.
    pub async fn flush_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn
            .keys(format!("{namespace}:*"))
            .await
            .map_err(store_error)?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = conn.del(&keys).await.map_err(store_error)?;
        Ok(removed)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn execute(&self, tx: Transaction) -> Result<bool, StoreError> {
        let mut invocation = self.transact.prepare_invoke();
        match tx.guard {
            Guard::Always => {
                invocation.arg("always");
            }
            Guard::RemoveFromList { key, member } => {
                invocation.key(key).arg("lrem").arg(member);
            }
            Guard::RemoveFromSorted { key, member } => {
                invocation.key(key).arg("zrem").arg(member);
            }
            Guard::Lock { key, value, ttl } => {
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                invocation.key(key).arg("lock").arg(value).arg(ttl_ms);
            }
        }

        for command in tx.commands {
            match command {
                Command::PushTail { key, member } => {
                    invocation.key(key).arg("lpush").arg(member);
                }
                Command::AddScored { key, score, member } => {
                    invocation.key(key).arg("zadd").arg(score).arg(member);
                }
                Command::AddToSet { key, member } => {
                    invocation.key(key).arg("sadd").arg(member);
                }
                Command::TrimScored {
                    key,
                    min_score,
                    max_len,
                } => {
                    invocation.key(key).arg("ztrim").arg(min_score).arg(max_len);
                }
                Command::DeleteIfEquals { key, value } => {
                    invocation.key(key).arg("delifeq").arg(value);
                }
            }
        }

        let mut conn = self.redis.clone();
        let applied: i64 = invocation.invoke_async(&mut conn).await.map_err(store_error)?;
        Ok(applied == 1)
    }

    async fn pop_head_push_tail(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        let moved: Option<String> = redis::cmd("RPOPLPUSH")
            .arg(src)
            .arg(dst)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(moved)
    }

    async fn range_by_score(&self, key: &str, max_score: i64) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        conn.zrangebyscore(key, "-inf", max_score)
            .await
            .map_err(store_error)
    }

    async fn list_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut members: Vec<String> = conn.lrange(key, 0, -1).await.map_err(store_error)?;
        members.reverse();
        Ok(members)
    }

    async fn sorted_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        conn.zrange(key, 0, -1).await.map_err(store_error)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        let mut members: Vec<String> = conn.smembers(key).await.map_err(store_error)?;
        members.sort();
        Ok(members)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        conn.llen(key).await.map_err(store_error)
    }

    async fn sorted_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        conn.zcard(key).await.map_err(store_error)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        conn.exists(key).await.map_err(store_error)
    }
}
