use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GuardError;
use crate::guard::Semaphore;
use crate::limits::{validate_key, validate_permits, validate_wait};
use crate::model::{SemaphoreInquiry, SemaphoreSettings, SlotKey};

use super::{LocalStore, Pool, PoolSlot};

/// In-process permit pool per key.
pub struct LocalSemaphore {
    store: Arc<LocalStore>,
}

impl LocalSemaphore {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    fn slot_for(&self, key: &str, settings: &SemaphoreSettings) -> Arc<PoolSlot> {
        let now = Instant::now();
        self.store
            .pools
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(PoolSlot {
                    pool: Mutex::new(Pool {
                        capacity: settings.capacity,
                        available: settings.capacity,
                        outstanding: Vec::new(),
                        last_touched: now,
                        lifetime: settings.lifetime,
                    }),
                    released: Notify::new(),
                })
            })
            .value()
            .clone()
    }
}

/// Re-apply settings to an existing pool: the last writer's capacity wins and
/// the available count moves by the same delta.
fn reshape(pool: &mut Pool, settings: &SemaphoreSettings, now: Instant) {
    if pool.is_expired(now) {
        pool.available = settings.capacity;
        pool.outstanding.clear();
    } else if pool.capacity != settings.capacity {
        let delta = i64::from(settings.capacity) - i64::from(pool.capacity);
        let available = (i64::from(pool.available) + delta).clamp(0, i64::from(settings.capacity));
        pool.available = u32::try_from(available).unwrap_or(0);
    }
    pool.capacity = settings.capacity;
    pool.lifetime = settings.lifetime;
    pool.last_touched = now;
}

#[async_trait]
impl Semaphore for LocalSemaphore {
    async fn try_acquire(
        &self,
        key: &SlotKey,
        settings: &SemaphoreSettings,
        inquiry: &SemaphoreInquiry,
    ) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(inquiry.wait)?;
        validate_permits(inquiry.permits, settings.capacity)?;

        let slot = self.slot_for(key.as_str(), settings);
        let deadline = Instant::now() + inquiry.wait;
        loop {
            // Register interest before checking so a release in between is not missed.
            let released = slot.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut pool = slot
                    .pool
                    .lock()
                    .map_err(|_| GuardError::Backend("semaphore pool poisoned".into()))?;
                reshape(&mut pool, settings, Instant::now());
                if inquiry.permits > pool.capacity {
                    debug!(key = %key, permits = inquiry.permits, capacity = pool.capacity, "permits exceed pool capacity");
                    return Ok(false);
                }
                if pool.available >= inquiry.permits {
                    pool.available -= inquiry.permits;
                    pool.outstanding.push(inquiry.permits);
                    metrics::gauge!(crate::observability::LOCAL_SEMAPHORE_POOLS)
                        .set(self.store.pools.len() as f64);
                    return Ok(true);
                }
            }

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                debug!(key = %key, permits = inquiry.permits, "semaphore wait elapsed");
                return Ok(false);
            }
        }
    }

    async fn release(&self, key: &SlotKey) -> Result<(), GuardError> {
        let Some(slot) = self.store.pools.get(key.as_str()).map(|e| e.value().clone()) else {
            return Ok(());
        };
        {
            let mut pool = slot
                .pool
                .lock()
                .map_err(|_| GuardError::Backend("semaphore pool poisoned".into()))?;
            let Some(permits) = pool.outstanding.pop() else {
                return Ok(());
            };
            pool.available = pool.available.saturating_add(permits).min(pool.capacity);
            pool.last_touched = Instant::now();
        }
        slot.released.notify_waiters();
        Ok(())
    }
}
