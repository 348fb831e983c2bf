use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::guard::LocalStore;

/// Background task that periodically evicts idle rate buckets, semaphore pools
/// and unused lock entries from a local store.
pub async fn run_reaper(store: Arc<LocalStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let evicted = store.evict_expired(tokio::time::Instant::now());
        if evicted > 0 {
            debug!("reaped {evicted} idle guard entries");
        }
        metrics::gauge!(crate::observability::LOCAL_RATE_BUCKETS).set(store.bucket_count() as f64);
        metrics::gauge!(crate::observability::LOCAL_SEMAPHORE_POOLS).set(store.pool_count() as f64);
        metrics::gauge!(crate::observability::LOCAL_FAIR_LOCKS).set(store.held_count() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::{LocalRateLimiter, RateLimiter};
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};

    #[tokio::test(start_paused = true)]
    async fn reaper_evicts_idle_buckets() {
        let store = Arc::new(LocalStore::new());
        let limiter = LocalRateLimiter::new(store.clone());
        let key = SlotKey::new(
            1,
            NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
            NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        );
        let settings = RateLimiterSettings {
            bucket_lifetime: Duration::from_secs(1),
            ..RateLimiterSettings::default()
        };
        assert!(limiter.try_acquire(&key, Duration::ZERO, &settings).await.unwrap());
        assert_eq!(store.bucket_count(), 1);

        let reaper = tokio::spawn(run_reaper(store.clone(), Duration::from_millis(500)));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.bucket_count(), 0);
        reaper.abort();
    }
}
