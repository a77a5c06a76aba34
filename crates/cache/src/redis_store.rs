//! Redis implementation of the KV port.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use tracing::info;

use crate::{KvError, KvStore};

/// Redis-backed [`KvStore`] over a deadpool connection pool.
pub struct RedisKvStore {
    pool: Pool,
}

impl std::fmt::Debug for RedisKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKvStore").finish_non_exhaustive()
    }
}

impl RedisKvStore {
    /// Build a pool from a `redis://` URL and verify connectivity with PING.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| KvError::Pool(e.to_string()))?;

        let store = Self { pool };
        store.ping().await?;
        info!("redis connection established");
        Ok(store)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, KvError> {
        self.pool.get().await.map_err(|e| KvError::Pool(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let () = conn.set_ex(key, value, ttl.as_secs().max(1) as usize).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        // SET key value NX EX <secs>; nil reply means the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let removed: u32 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.keys(pattern).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let () = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
