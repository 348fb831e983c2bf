use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::error::GuardError;
use crate::guard::FairLock;
use crate::limits::{validate_key, validate_wait};
use crate::model::SlotKey;

use super::{LocalStore, SharedLock};

/// In-process fair lock.
///
/// Each key maps to a `tokio::sync::Mutex`, whose waiters are served in FIFO
/// order. A waiter that times out is dropped from the queue without
/// disturbing anyone behind it. The owned guard is parked in the store under
/// the owner's id until `unlock`.
pub struct LocalFairLock {
    store: Arc<LocalStore>,
}

impl LocalFairLock {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    fn mutex_for(&self, key: &str) -> SharedLock {
        self.store
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }
}

#[async_trait]
impl FairLock for LocalFairLock {
    async fn try_lock(&self, key: &SlotKey, owner: Ulid, max_wait: Duration) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(max_wait)?;

        // Clone the Arc out so no map shard stays locked across the await.
        let mutex = self.mutex_for(key.as_str());
        let guard = if max_wait.is_zero() {
            match mutex.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => return Ok(false),
            }
        } else {
            match tokio::time::timeout(max_wait, mutex.lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(key = %key, "fair lock wait elapsed");
                    return Ok(false);
                }
            }
        };

        self.store.holders.insert(key.as_str().to_string(), (owner, guard));
        metrics::gauge!(crate::observability::LOCAL_FAIR_LOCKS).set(self.store.held_count() as f64);
        Ok(true)
    }

    async fn is_held_by(&self, key: &SlotKey, owner: Ulid) -> Result<bool, GuardError> {
        Ok(self
            .store
            .holders
            .get(key.as_str())
            .is_some_and(|e| e.value().0 == owner))
    }

    async fn unlock(&self, key: &SlotKey, owner: Ulid) -> Result<bool, GuardError> {
        // Dropping the removed guard hands the mutex to the next queued waiter.
        let removed = self
            .store
            .holders
            .remove_if(key.as_str(), |_, (holder, _)| *holder == owner);
        metrics::gauge!(crate::observability::LOCAL_FAIR_LOCKS).set(self.store.held_count() as f64);
        Ok(removed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use chrono::{NaiveDate, NaiveTime};
    use tokio::sync::Mutex;

    fn key() -> SlotKey {
        SlotKey::new(
            1,
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        )
    }

    fn lock() -> Arc<LocalFairLock> {
        Arc::new(LocalFairLock::new(Arc::new(LocalStore::new())))
    }

    #[tokio::test]
    async fn lock_and_unlock() {
        let lock = lock();
        let owner = Ulid::new();
        assert!(lock.try_lock(&key(), owner, Duration::from_millis(10)).await.unwrap());
        assert!(lock.is_held_by(&key(), owner).await.unwrap());
        assert!(lock.unlock(&key(), owner).await.unwrap());
        assert!(!lock.is_held_by(&key(), owner).await.unwrap());
    }

    #[tokio::test]
    async fn contended_lock_times_out_within_bound() {
        let lock = lock();
        let holder = Ulid::new();
        assert!(lock.try_lock(&key(), holder, Duration::ZERO).await.unwrap());

        let start = Instant::now();
        let got = lock
            .try_lock(&key(), Ulid::new(), Duration::from_millis(200))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(!got);
        assert!(elapsed >= Duration::from_millis(190), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "waited too long: {elapsed:?}");
    }

    #[tokio::test]
    async fn unlock_by_non_holder_is_noop() {
        let lock = lock();
        let holder = Ulid::new();
        let stranger = Ulid::new();
        assert!(lock.try_lock(&key(), holder, Duration::ZERO).await.unwrap());

        assert!(!lock.unlock(&key(), stranger).await.unwrap());
        assert!(lock.is_held_by(&key(), holder).await.unwrap());
        assert!(!lock.is_held_by(&key(), stranger).await.unwrap());

        // Unlocking a key nobody ever locked is also fine
        let other = SlotKey::new(
            2,
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        );
        assert!(!lock.unlock(&other, stranger).await.unwrap());
    }

    #[tokio::test]
    async fn waiters_acquire_in_arrival_order() {
        let lock = lock();
        let holder = Ulid::new();
        assert!(lock.try_lock(&key(), holder, Duration::ZERO).await.unwrap());

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let lock = lock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let me = Ulid::new();
                assert!(lock.try_lock(&key(), me, Duration::from_secs(5)).await.unwrap());
                order.lock().await.push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert!(lock.unlock(&key(), me).await.unwrap());
            }));
            // Make arrival order unambiguous
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(lock.unlock(&key(), holder).await.unwrap());
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn timed_out_waiter_does_not_block_queue() {
        let lock = lock();
        let holder = Ulid::new();
        assert!(lock.try_lock(&key(), holder, Duration::ZERO).await.unwrap());

        let impatient = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_lock(&key(), Ulid::new(), Duration::from_millis(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let patient_owner = Ulid::new();
        let patient = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_lock(&key(), patient_owner, Duration::from_secs(5)).await })
        };

        assert!(!impatient.await.unwrap().unwrap());
        assert!(lock.unlock(&key(), holder).await.unwrap());
        assert!(patient.await.unwrap().unwrap());
        assert!(lock.is_held_by(&key(), patient_owner).await.unwrap());
    }
}
