use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::metrics::track_cache_operation;

/// Transient keyed counters with a TTL, used for throttling.
#[async_trait]
pub trait ExpiringCache: Send + Sync {
    /// Counts one hit against `key` inside a fixed window. Returns `false`
    /// once `limit` hits were already recorded in the current window.
    async fn hit_within_limit(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

const HIT_WITHIN_LIMIT_SCRIPT: &str = r#"
    local key = KEYS[1]
    local limit = tonumber(ARGV[1])
    local window = tonumber(ARGV[2])

    local current = redis.call('GET', key)

    if current == false then
        redis.call('SET', key, 1, 'EX', window)
        return 1
    end

    current = tonumber(current)

    if current >= limit then
        return 0
    end

    redis.call('INCR', key)
    return 1
"#;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ExpiringCache for RedisCache {
    async fn hit_within_limit(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let allowed: u32 = track_cache_operation("eval_rate_limit", async {
            redis::Script::new(HIT_WITHIN_LIMIT_SCRIPT)
                .key(key)
                .arg(limit)
                .arg(window_secs)
                .invoke_async(&mut conn)
                .await
                .context("Rate limit script failed")
        })
        .await?;
        Ok(allowed == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        track_cache_operation("ping", async {
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .context("Redis PING failed")
        })
        .await?;
        Ok(())
    }
}

/// Single-process cache; windows are tracked with the tokio clock so paused
/// time in tests advances them.
#[derive(Default)]
pub struct InMemoryCache {
    counters: Mutex<HashMap<String, (u32, Instant)>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExpiringCache for InMemoryCache {
    async fn hit_within_limit(&self, key: &str, limit: u32, window_secs: u64) -> Result<bool> {
        let now = Instant::now();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, (_, expires)| *expires > now);

        match counters.get_mut(key) {
            None => {
                counters.insert(key.to_string(), (1, now + Duration::from_secs(window_secs)));
                Ok(true)
            }
            Some((count, _)) if *count >= limit => Ok(false),
            Some((count, _)) => {
                *count += 1;
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_limit_blocks_after_quota() {
        let cache = InMemoryCache::new();
        for _ in 0..3 {
            assert!(cache.hit_within_limit("k", 3, 60).await.unwrap());
        }
        assert!(!cache.hit_within_limit("k", 3, 60).await.unwrap());
        assert!(cache.hit_within_limit("other", 3, 60).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_window_resets() {
        let cache = InMemoryCache::new();
        assert!(cache.hit_within_limit("k", 1, 10).await.unwrap());
        assert!(!cache.hit_within_limit("k", 1, 10).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.hit_within_limit("k", 1, 10).await.unwrap());
    }
}
