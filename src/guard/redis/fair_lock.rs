use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::error::GuardError;
use crate::guard::{duration_ms, FairLock};
use crate::limits::{validate_key, validate_wait};
use crate::model::SlotKey;

use super::tagged;

/// One acquisition attempt.
///
/// KEYS[1] holder (string, leased), KEYS[2] waiter queue (list),
/// KEYS[3] waiter heartbeats (zset, score = stale deadline ms)
/// ARGV[1] owner, ARGV[2] lease ms, ARGV[3] heartbeat ttl ms
///
/// Stale waiters at the head of the queue (their process stopped polling) are
/// dropped first. The lock is granted only when it is free and the caller is
/// at the head of the queue, or the queue is empty. Otherwise the caller is
/// appended once and its heartbeat refreshed. Returns 1 when held.
const ACQUIRE: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
while true do
  local head = redis.call('LINDEX', KEYS[2], 0)
  if not head then break end
  local deadline = redis.call('ZSCORE', KEYS[3], head)
  if deadline and tonumber(deadline) >= now then break end
  redis.call('LPOP', KEYS[2])
  redis.call('ZREM', KEYS[3], head)
end
local holder = redis.call('GET', KEYS[1])
if holder == ARGV[1] then
  return 1
end
local head = redis.call('LINDEX', KEYS[2], 0)
if (not holder) and ((not head) or head == ARGV[1]) then
  if head == ARGV[1] then
    redis.call('LPOP', KEYS[2])
  end
  redis.call('ZREM', KEYS[3], ARGV[1])
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return 1
end
if not redis.call('ZSCORE', KEYS[3], ARGV[1]) then
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), ARGV[1])
redis.call('PEXPIRE', KEYS[2], tonumber(ARGV[2]) + tonumber(ARGV[3]))
redis.call('PEXPIRE', KEYS[3], tonumber(ARGV[2]) + tonumber(ARGV[3]))
return 0
"#;

/// Leave the queue after giving up. If the grant raced with the give-up, the
/// lock is released again so the next waiter is not stranded behind a lease.
///
/// KEYS as ACQUIRE; ARGV[1] owner
const ABANDON: &str = r#"
redis.call('LREM', KEYS[2], 0, ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
end
return 1
"#;

/// Compare-and-delete on the holder key. KEYS[1] holder; ARGV[1] owner
const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Extend the lease while still the holder. KEYS[1] holder; ARGV[1] owner,
/// ARGV[2] lease ms
const RENEW: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lease watchdogs by holder key and owner. Dropping the last handle stops
/// every watchdog so leases run out on their own.
#[derive(Default)]
struct Renewals(DashMap<(String, Ulid), AbortHandle>);

impl Renewals {
    fn start(&self, holder: String, owner: Ulid, task: AbortHandle) {
        if let Some(previous) = self.0.insert((holder, owner), task) {
            previous.abort();
        }
    }

    fn stop(&self, holder: &str, owner: Ulid) {
        if let Some((_, task)) = self.0.remove(&(holder.to_string(), owner)) {
            task.abort();
        }
    }
}

impl Drop for Renewals {
    fn drop(&mut self) {
        for entry in self.0.iter() {
            entry.value().abort();
        }
    }
}

/// FIFO fair lock on Redis.
///
/// Waiters queue in a list and poll; each poll doubles as a heartbeat so a
/// crashed waiter is skipped once its heartbeat goes stale. The holder key is
/// leased, so a crashed holder frees the slot after `lease`. A live holder
/// renews the lease every `lease / 3` until it unlocks.
#[derive(Clone)]
pub struct RedisFairLock {
    conn: ConnectionManager,
    lease: Duration,
    acquire: Script,
    abandon: Script,
    release: Script,
    renew: Script,
    renewals: Arc<Renewals>,
}

impl RedisFairLock {
    pub fn new(conn: ConnectionManager, lease: Duration) -> Self {
        Self {
            conn,
            lease,
            acquire: Script::new(ACQUIRE),
            abandon: Script::new(ABANDON),
            release: Script::new(RELEASE),
            renew: Script::new(RENEW),
            renewals: Arc::new(Renewals::default()),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Number of leases currently kept alive by this lock.
    pub fn renewing(&self) -> usize {
        self.renewals.0.len()
    }

    fn watch(&self, key: &SlotKey, holder: String, owner: Ulid) {
        let mut conn = self.conn.clone();
        let renew = self.renew.clone();
        let lease_ms = duration_ms(self.lease).max(1);
        let every = (self.lease / 3).max(Duration::from_millis(1));
        let log_key = key.clone();
        let script_holder = holder.clone();
        let task = tokio::spawn(async move {
            let owner_id = owner.to_string();
            loop {
                tokio::time::sleep(every).await;
                let renewed: Result<i64, _> = renew
                    .key(&script_holder)
                    .arg(&owner_id)
                    .arg(lease_ms)
                    .invoke_async(&mut conn)
                    .await;
                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        warn!(key = %log_key, %owner, "fair lock lease lost before unlock");
                        break;
                    }
                    Err(e) => warn!(key = %log_key, error = %e, "fair lock lease renewal failed"),
                }
            }
        });
        self.renewals.start(holder, owner, task.abort_handle());
    }

    fn keys(key: &SlotKey) -> [String; 3] {
        [
            tagged("fair_lock", key.as_str()),
            tagged("fair_lock_queue", key.as_str()),
            tagged("fair_lock_timeout", key.as_str()),
        ]
    }

    /// Heartbeats must outlive a poll by a wide margin.
    fn heartbeat_ttl() -> u64 {
        duration_ms(POLL_INTERVAL) * 10
    }
}

#[async_trait]
impl FairLock for RedisFairLock {
    async fn try_lock(&self, key: &SlotKey, owner: Ulid, max_wait: Duration) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(max_wait)?;

        let mut conn = self.conn.clone();
        let [holder, queue, heartbeats] = Self::keys(key);
        let owner_arg = owner.to_string();
        let deadline = Instant::now() + max_wait;
        loop {
            let granted: i64 = self
                .acquire
                .key(&holder)
                .key(&queue)
                .key(&heartbeats)
                .arg(&owner_arg)
                .arg(duration_ms(self.lease).max(1))
                .arg(Self::heartbeat_ttl())
                .invoke_async(&mut conn)
                .await?;
            if granted == 1 {
                self.watch(key, holder, owner);
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }

        debug!(key = %key, "fair lock wait elapsed");
        let abandoned: Result<i64, _> = self
            .abandon
            .key(&holder)
            .key(&queue)
            .key(&heartbeats)
            .arg(&owner_arg)
            .invoke_async(&mut conn)
            .await;
        if let Err(e) = abandoned {
            // The heartbeat goes stale on its own.
            warn!(key = %key, error = %e, "failed to leave fair lock queue");
        }
        Ok(false)
    }

    async fn is_held_by(&self, key: &SlotKey, owner: Ulid) -> Result<bool, GuardError> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(tagged("fair_lock", key.as_str())).await?;
        Ok(holder.is_some_and(|h| h == owner.to_string()))
    }

    async fn unlock(&self, key: &SlotKey, owner: Ulid) -> Result<bool, GuardError> {
        let holder = tagged("fair_lock", key.as_str());
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(&holder)
            .arg(owner.to_string())
            .invoke_async(&mut conn)
            .await?;
        self.renewals.stop(&holder, owner);
        Ok(removed == 1)
    }
}
