//! Redis-backed [`CacheStore`].
//!
//! Uses a multiplexed `ConnectionManager`, which reconnects on its own, so
//! the handle is cloned per call instead of being locked.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::info;

use super::{CacheFields, CacheFuture, CacheStore};
use crate::errors::CacheError;

/// Signed URL cache stored in Redis hashes.
#[derive(Clone)]
pub struct RedisCacheStore {
    conn: ConnectionManager,
}

impl RedisCacheStore {
    /// Connect to `redis_url` and verify the server answers `PING` within
    /// `timeout`.
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;

        let connect = async {
            let mut conn = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, CacheError>(conn)
        };

        let conn = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| CacheError::TimedOut(timeout))??;

        info!("Connected to Redis cache");
        Ok(Self { conn })
    }
}

// -- Wire commands ------------------------------------------------------------

/// `HMGET key url exp`.
fn fetch_cmd(key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("HMGET");
    cmd.arg(key).arg("url").arg("exp");
    cmd
}

/// `MULTI; HSET key url <url> exp <unix secs>; EXPIRE key <ttl secs>; EXEC`.
///
/// The hash and its TTL are written atomically so an entry never lives
/// without an expiry.
fn put_pipeline(key: &str, url: &str, expires_at: i64, ttl: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("HSET")
        .arg(key)
        .arg("url")
        .arg(url)
        .arg("exp")
        .arg(expires_at)
        .ignore()
        .cmd("EXPIRE")
        .arg(key)
        .arg(ttl.as_secs())
        .ignore();
    pipe
}

/// `DEL key`.
fn delete_cmd(key: &str) -> redis::Cmd {
    let mut cmd = redis::cmd("DEL");
    cmd.arg(key);
    cmd
}

impl CacheStore for RedisCacheStore {
    fn fetch(&self, key: &str) -> CacheFuture<'_, CacheFields> {
        let cmd = fetch_cmd(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let (url, exp): (Option<String>, Option<String>) = cmd.query_async(&mut conn).await?;
            Ok(CacheFields { url, exp })
        })
    }

    fn put(&self, key: &str, url: &str, expires_at: i64, ttl: Duration) -> CacheFuture<'_, ()> {
        let pipe = put_pipeline(key, url, expires_at, ttl);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            pipe.query_async::<_, ()>(&mut conn).await?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> CacheFuture<'_, ()> {
        let cmd = delete_cmd(key);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: usize = cmd.query_async(&mut conn).await?;
            Ok(())
        })
    }
}
