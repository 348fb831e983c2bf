use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::Script;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GuardError;
use crate::guard::{duration_ms, Semaphore};
use crate::limits::{validate_key, validate_permits, validate_wait};
use crate::model::{SemaphoreInquiry, SemaphoreSettings, SlotKey};

use super::tagged;

/// KEYS[1] pool hash {capacity, available}
/// ARGV[1] capacity, ARGV[2] permits, ARGV[3] lifetime ms
///
/// Creates the pool on first use, re-applies capacity (last writer wins,
/// available moves by the delta, clamped) and slides the expiry.
/// Returns 1 when taken, 0 when short, -1 when permits exceed capacity.
const ACQUIRE: &str = r#"
local capacity = tonumber(ARGV[1])
local permits = tonumber(ARGV[2])
local available
if redis.call('EXISTS', KEYS[1]) == 0 then
  available = capacity
else
  local old = tonumber(redis.call('HGET', KEYS[1], 'capacity'))
  available = tonumber(redis.call('HGET', KEYS[1], 'available'))
  available = math.max(0, math.min(capacity, available + capacity - old))
end
redis.call('HSET', KEYS[1], 'capacity', capacity, 'available', available)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
if permits > capacity then
  return -1
end
if available >= permits then
  redis.call('HSET', KEYS[1], 'available', available - permits)
  return 1
end
return 0
"#;

/// KEYS[1] pool hash; ARGV[1] permits, ARGV[2] lifetime ms. Never exceeds capacity.
const RELEASE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local capacity = tonumber(redis.call('HGET', KEYS[1], 'capacity'))
local available = tonumber(redis.call('HGET', KEYS[1], 'available'))
redis.call('HSET', KEYS[1], 'available', math.min(capacity, available + tonumber(ARGV[1])))
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Permit pools on Redis. The permit counts of this process's unreleased
/// acquisitions are remembered locally so `release` knows what to return.
#[derive(Clone)]
pub struct RedisSemaphore {
    conn: ConnectionManager,
    outstanding: Arc<DashMap<String, Vec<(u32, Duration)>>>,
    acquire: Script,
    release: Script,
}

impl RedisSemaphore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            outstanding: Arc::new(DashMap::new()),
            acquire: Script::new(ACQUIRE),
            release: Script::new(RELEASE),
        }
    }
}

#[async_trait]
impl Semaphore for RedisSemaphore {
    async fn try_acquire(
        &self,
        key: &SlotKey,
        settings: &SemaphoreSettings,
        inquiry: &SemaphoreInquiry,
    ) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(inquiry.wait)?;
        validate_permits(inquiry.permits, settings.capacity)?;

        let mut conn = self.conn.clone();
        let pool = tagged("semaphore", key.as_str());
        let deadline = Instant::now() + inquiry.wait;
        loop {
            let taken: i64 = self
                .acquire
                .key(&pool)
                .arg(settings.capacity)
                .arg(inquiry.permits)
                .arg(duration_ms(settings.lifetime).max(1))
                .invoke_async(&mut conn)
                .await?;
            match taken {
                1 => {
                    self.outstanding
                        .entry(key.as_str().to_string())
                        .or_default()
                        .push((inquiry.permits, settings.lifetime));
                    return Ok(true);
                }
                -1 => {
                    debug!(key = %key, permits = inquiry.permits, capacity = settings.capacity, "permits exceed pool capacity");
                    return Ok(false);
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, permits = inquiry.permits, "semaphore wait elapsed");
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn release(&self, key: &SlotKey) -> Result<(), GuardError> {
        let popped = self
            .outstanding
            .get_mut(key.as_str())
            .and_then(|mut held| held.pop());
        self.outstanding.remove_if(key.as_str(), |_, held| held.is_empty());
        let Some((permits, lifetime)) = popped else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(tagged("semaphore", key.as_str()))
            .arg(permits)
            .arg(duration_ms(lifetime).max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
