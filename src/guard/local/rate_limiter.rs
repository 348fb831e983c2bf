use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GuardError;
use crate::guard::RateLimiter;
use crate::limits::{validate_key, validate_rate, validate_wait};
use crate::model::{RateLimiterSettings, RateScope, SlotKey};

use super::{Bucket, LocalStore};

/// Result of one look at a bucket.
enum Take {
    Taken,
    /// Time until the next whole token is earned.
    Wait(Duration),
}

/// In-process token bucket. Capacity is `permits_per_interval`; tokens are
/// earned continuously at `permits_per_interval / interval`.
pub struct LocalRateLimiter {
    store: Arc<LocalStore>,
}

impl LocalRateLimiter {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    fn bucket_key(&self, key: &SlotKey, scope: RateScope) -> String {
        match scope {
            RateScope::Whole => key.as_str().to_string(),
            RateScope::PerClient => key.scoped_to(&self.store.client_id),
        }
    }

    fn take(&self, bucket_key: &str, settings: &RateLimiterSettings) -> Result<Take, GuardError> {
        let now = Instant::now();
        let bucket = self
            .store
            .buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Bucket {
                    tokens: f64::from(settings.permits_per_interval),
                    last_refill: now,
                    last_touched: now,
                    settings: *settings,
                }))
            })
            .value()
            .clone();
        let mut b = bucket
            .lock()
            .map_err(|_| GuardError::Backend("rate bucket poisoned".into()))?;

        if b.is_expired(now) {
            b.tokens = f64::from(settings.permits_per_interval);
            b.last_refill = now;
        }

        // Earned tokens are kept across a settings change, capped by the new capacity.
        refill(&mut b, now);
        b.settings = *settings;
        let capacity = f64::from(settings.permits_per_interval);
        b.tokens = b.tokens.min(capacity);
        b.last_touched = now;

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            return Ok(Take::Taken);
        }
        let per_token = settings.interval.as_secs_f64() / capacity;
        // Unrepresentable means the token never arrives in any bounded wait.
        let wait = Duration::try_from_secs_f64((1.0 - b.tokens) * per_token).unwrap_or(Duration::MAX);
        Ok(Take::Wait(wait.max(Duration::from_millis(1))))
    }
}

fn refill(b: &mut Bucket, now: Instant) {
    let elapsed = now.saturating_duration_since(b.last_refill).as_secs_f64();
    let capacity = f64::from(b.settings.permits_per_interval);
    let rate = capacity / b.settings.interval.as_secs_f64();
    b.tokens = (b.tokens + elapsed * rate).min(capacity);
    b.last_refill = now;
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn try_acquire(
        &self,
        key: &SlotKey,
        max_wait: Duration,
        settings: &RateLimiterSettings,
    ) -> Result<bool, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(max_wait)?;
        validate_rate(settings.permits_per_interval, settings.interval, settings.bucket_lifetime)?;

        let bucket_key = self.bucket_key(key, settings.scope);
        let deadline = Instant::now() + max_wait;
        loop {
            let wait = match self.take(&bucket_key, settings)? {
                Take::Taken => {
                    metrics::gauge!(crate::observability::LOCAL_RATE_BUCKETS)
                        .set(self.store.buckets.len() as f64);
                    return Ok(true);
                }
                Take::Wait(wait) => wait,
            };
            // Don't sleep for a token that can't arrive in time.
            if wait > deadline.saturating_duration_since(Instant::now()) {
                debug!(key = %key, "rate limit exhausted");
                return Ok(false);
            }
            tokio::time::sleep(wait).await;
        }
    }
}
