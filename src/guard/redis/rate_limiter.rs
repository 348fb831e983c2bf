use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use ulid::Ulid;

use crate::error::GuardError;
use crate::guard::{duration_ms, RateLimiter};
use crate::limits::{validate_key, validate_rate, validate_wait};
use crate::model::{RateLimiterSettings, RateScope, SlotKey};

use super::tagged;

/// Token bucket in a hash `{tokens, ts}`. Takes one token if available and
/// returns 0, otherwise returns the milliseconds until the next token. Uses the
/// server clock so every process agrees on refill.
///
/// KEYS[1] bucket; ARGV[1] capacity, ARGV[2] interval ms, ARGV[3] lifetime ms
const TAKE_TOKEN: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local capacity = tonumber(ARGV[1])
local interval = tonumber(ARGV[2])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + elapsed * capacity / interval)
local wait = 0
if tokens >= 1 then
  tokens = tokens - 1
else
  wait = math.max(1, math.ceil((1 - tokens) * interval / capacity))
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return wait
"#;

/// Rate limiter whose buckets live in Redis and are shared by every process.
#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    client_id: Ulid,
    take: Script,
}

impl RedisRateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            client_id: Ulid::new(),
            take: Script::new(TAKE_TOKEN),
        }
    }

    fn bucket_key(&self, key: &SlotKey, scope: RateScope) -> String {
        match scope {
            RateScope::Whole => tagged("rate_limit", key.as_str()),
            RateScope::PerClient => {
                format!("{}:client:{}", tagged("rate_limit", key.as_str()), self.client_id)
            }
        }
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn try_acquire(
        &self,
        key: &SlotKey,
        max_wait: Duration,
        settings: &RateLimiterSettings,
    ) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(max_wait)?;
        validate_rate(settings.permits_per_interval, settings.interval, settings.bucket_lifetime)?;

        let mut conn = self.conn.clone();
        let bucket = self.bucket_key(key, settings.scope);
        let deadline = Instant::now() + max_wait;
        loop {
            let wait_ms: u64 = self
                .take
                .key(&bucket)
                .arg(settings.permits_per_interval)
                .arg(duration_ms(settings.interval).max(1))
                .arg(duration_ms(settings.bucket_lifetime).max(1))
                .invoke_async(&mut conn)
                .await?;
            if wait_ms == 0 {
                return Ok(true);
            }
            let wait = Duration::from_millis(wait_ms);
            if Instant::now() + wait > deadline {
                debug!(key = %key, wait_ms, "rate limit exhausted");
                return Ok(false);
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    fn unique_key() -> SlotKey {
        let id = u64::from(Ulid::new().random() as u32);
        SlotKey::new(
            id,
            NaiveDate::from_ymd_opt(2024, 8, 1).unwrap(),
            NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn redis_bucket_admits_then_denies() {
        let conn = super::super::connect("redis://127.0.0.1:6379").await.unwrap();
        let limiter = RedisRateLimiter::new(conn);
        let key = unique_key();
        let settings = RateLimiterSettings {
            scope: RateScope::Whole,
            permits_per_interval: 2,
            interval: Duration::from_secs(60),
            bucket_lifetime: Duration::from_secs(5),
        };
        assert!(limiter.try_acquire(&key, Duration::ZERO, &settings).await.unwrap());
        assert!(limiter.try_acquire(&key, Duration::ZERO, &settings).await.unwrap());
        assert!(!limiter.try_acquire(&key, Duration::from_millis(100), &settings).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn redis_bucket_refills() {
        let conn = super::super::connect("redis://127.0.0.1:6379").await.unwrap();
        let limiter = RedisRateLimiter::new(conn);
        let key = unique_key();
        let settings = RateLimiterSettings {
            scope: RateScope::Whole,
            permits_per_interval: 1,
            interval: Duration::from_millis(200),
            bucket_lifetime: Duration::from_secs(5),
        };
        assert!(limiter.try_acquire(&key, Duration::ZERO, &settings).await.unwrap());
        assert!(limiter.try_acquire(&key, Duration::from_millis(500), &settings).await.unwrap());
    }
}
