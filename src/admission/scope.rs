//! Guarded execution: run a piece of work while holding a lock, and release
//! on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::error::{AdmissionError, GuardError};
use crate::guard::{FairLock, FallbackLockCoordinator, Semaphore};
use crate::model::SlotKey;
use crate::observability::{GUARD_WAIT_SECONDS, RELEASE_FAILURES_TOTAL};

/// A pending release. Awaited inline on the normal path; if the owning future
/// is dropped first (caller cancelled), the release is spawned instead so the
/// guard does not stay held until its lease runs out.
pub(crate) struct Compensation {
    pending: Option<BoxFuture<'static, ()>>,
}

impl Compensation {
    pub fn new(release: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            pending: Some(release.boxed()),
        }
    }

    pub async fn run(mut self) {
        if let Some(release) = self.pending.take() {
            release.await;
        }
    }
}

impl Drop for Compensation {
    fn drop(&mut self) {
        if let Some(release) = self.pending.take()
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(release);
        }
    }
}

/// Result of running work under the fair lock.
pub enum Locked<T> {
    /// The lock was attempted; the work ran or the lock was not obtained.
    Completed(Result<T, AdmissionError>),
    /// The lock backend could not be reached. Nothing ran, nothing is held.
    Unreachable(GuardError),
}

/// Run `work` while holding the fair lock for `key`.
///
/// Not obtaining the lock within `wait` is `LockContention` and releases
/// nothing. Once obtained, the lock is released after `work` whatever it
/// returns, and only if this caller still holds it.
pub async fn with_fair_lock<T, F, Fut>(
    lock: &Arc<dyn FairLock>,
    key: &SlotKey,
    wait: Duration,
    work: F,
) -> Locked<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AdmissionError>>,
{
    let owner = Ulid::new();
    let started = Instant::now();
    let acquired = lock.try_lock(key, owner, wait).await;
    metrics::histogram!(GUARD_WAIT_SECONDS, "guard" => "fair_lock").record(started.elapsed().as_secs_f64());
    match acquired {
        Ok(true) => debug!(key = %key, %owner, "fair lock acquired"),
        Ok(false) => {
            warn!(key = %key, "fair lock not acquired within {wait:?}");
            return Locked::Completed(Err(AdmissionError::LockContention));
        }
        Err(e) if e.is_unavailable() => return Locked::Unreachable(e),
        Err(e) => {
            error!(key = %key, error = %e, "fair lock backend error");
            return Locked::Completed(Err(e.into()));
        }
    }

    let unlock = Compensation::new(release_fair_lock(lock.clone(), key.clone(), owner));
    let result = work().await;
    unlock.run().await;
    Locked::Completed(result)
}

async fn release_fair_lock(lock: Arc<dyn FairLock>, key: SlotKey, owner: Ulid) {
    let outcome = match lock.is_held_by(&key, owner).await {
        Ok(true) => lock.unlock(&key, owner).await,
        Ok(false) => Ok(false),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(true) => debug!(key = %key, %owner, "fair lock released"),
        Ok(false) => warn!(key = %key, %owner, "fair lock no longer held at release"),
        Err(e) => {
            warn!(key = %key, error = %e, "fair lock release failed, left to lease expiry");
            metrics::counter!(RELEASE_FAILURES_TOTAL, "guard" => "fair_lock").increment(1);
        }
    }
}

/// Run `work` under the database lock for `key` (degraded mode).
///
/// Constraint, connection and transient store failures from `work` come back
/// as a single `PersistenceUnprocessable`. The lock is always released once
/// obtained; when it was not obtained there is nothing to release.
pub async fn with_fallback_lock<T, F, Fut>(
    coordinator: &Arc<dyn FallbackLockCoordinator>,
    key: &SlotKey,
    wait: Duration,
    work: F,
) -> Result<T, AdmissionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AdmissionError>>,
{
    let started = Instant::now();
    let acquired = coordinator.try_lock(key, wait).await;
    metrics::histogram!(GUARD_WAIT_SECONDS, "guard" => "fallback_lock").record(started.elapsed().as_secs_f64());
    let held = match acquired {
        Ok(Some(held)) => held,
        Ok(None) => {
            warn!(key = %key, "database lock not acquired within {wait:?}");
            return Err(AdmissionError::LockContention);
        }
        Err(e) => {
            error!(key = %key, error = %e, "database lock failed");
            return Err(e.into());
        }
    };

    let log_key = key.clone();
    let release = Compensation::new(async move {
        if let Err(e) = held.release().await {
            warn!(key = %log_key, error = %e, "database lock release failed");
            metrics::counter!(RELEASE_FAILURES_TOTAL, "guard" => "fallback_lock").increment(1);
        }
    });
    let result = work().await.map_err(unprocessable);
    release.run().await;
    result
}

fn unprocessable(e: AdmissionError) -> AdmissionError {
    match e {
        AdmissionError::Store(store) if store.is_unprocessable() => {
            AdmissionError::PersistenceUnprocessable(store.to_string())
        }
        other => other,
    }
}

/// Release the most recent acquisition on `key`.
pub(crate) async fn release_permits(semaphore: Arc<dyn Semaphore>, key: SlotKey) {
    if let Err(e) = semaphore.release(&key).await {
        warn!(key = %key, error = %e, "semaphore release failed, left to pool expiry");
        metrics::counter!(RELEASE_FAILURES_TOTAL, "guard" => "semaphore").increment(1);
    }
}
