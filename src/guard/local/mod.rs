//! Process-local guard tier. Used for single-instance deployments and as the
//! degraded substitute when the distributed tier is down.

mod fair_lock;
mod lock_coordinator;
mod rate_limiter;
mod semaphore;

pub use fair_lock::LocalFairLock;
pub use lock_coordinator::LocalLockCoordinator;
pub use rate_limiter::LocalRateLimiter;
pub use semaphore::LocalSemaphore;

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::RateLimiterSettings;

pub(crate) struct Bucket {
    pub tokens: f64,
    pub last_refill: Instant,
    pub last_touched: Instant,
    pub settings: RateLimiterSettings,
}

impl Bucket {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_touched) > self.settings.bucket_lifetime
    }
}

pub(crate) struct Pool {
    pub capacity: u32,
    pub available: u32,
    /// Permits of unreleased acquisitions, most recent last.
    pub outstanding: Vec<u32>,
    pub last_touched: Instant,
    pub lifetime: std::time::Duration,
}

impl Pool {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_touched) > self.lifetime
    }
}

pub(crate) struct PoolSlot {
    pub pool: Mutex<Pool>,
    pub released: Notify,
}

pub(crate) type SharedLock = Arc<tokio::sync::Mutex<()>>;

/// State shared by every local guard of one process.
///
/// Created once and handed to each guard by `Arc`; tests build a fresh store
/// per case instead of sharing global state.
pub struct LocalStore {
    pub(crate) buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    pub(crate) pools: DashMap<String, Arc<PoolSlot>>,
    pub(crate) locks: DashMap<String, SharedLock>,
    pub(crate) holders: DashMap<String, (Ulid, OwnedMutexGuard<()>)>,
    /// Identity used for `RateScope::PerClient` buckets.
    pub(crate) client_id: Ulid,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            pools: DashMap::new(),
            locks: DashMap::new(),
            holders: DashMap::new(),
            client_id: Ulid::new(),
        }
    }

    pub fn client_id(&self) -> Ulid {
        self.client_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Fair locks currently held.
    pub fn held_count(&self) -> usize {
        self.holders.len()
    }

    /// Available permits of the pool for `key`, if one exists.
    pub fn available_permits(&self, key: &str) -> Option<u32> {
        let slot = self.pools.get(key).map(|e| e.value().clone())?;
        let pool = slot.pool.lock().ok()?;
        Some(pool.available)
    }

    // ── Eviction ─────────────────────────────────────────────

    /// Drop buckets and pools idle past their lifetime, and lock entries that
    /// nobody holds or waits on. Returns the number of entries removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.buckets.len() + self.pools.len() + self.locks.len();

        // An entry referenced outside the map is mid-call; keep it.
        self.buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || bucket.lock().map(|b| !b.is_expired(now)).unwrap_or(false)
        });

        self.pools.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.pool.lock().map(|p| !p.is_expired(now)).unwrap_or(false)
        });

        self.locks
            .retain(|key, lock| Arc::strong_count(lock) > 1 || self.holders.contains_key(key));

        let after = self.buckets.len() + self.pools.len() + self.locks.len();
        before.saturating_sub(after)
    }
}
