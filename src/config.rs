use std::time::Duration;

use crate::limits::{MAX_INTERVAL, MAX_PERMITS_PER_INTERVAL, MAX_WAIT, MIN_LIFETIME};
use crate::model::{RateLimiterSettings, RateScope};

/// Wait bounds, leases and lifetimes for one `AdmissionController`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub rate_limiter: RateLimiterSettings,
    /// How long a caller may wait for a rate-limiter token.
    pub rate_limit_wait: Duration,
    /// How long a caller may queue for the fair lock.
    pub lock_wait: Duration,
    /// Lease on a distributed lock so a crashed holder frees the slot.
    pub lock_lease: Duration,
    /// How long a caller may wait for semaphore permits.
    pub semaphore_wait: Duration,
    /// Idle time after which a permit pool is dropped.
    pub semaphore_lifetime: Duration,
    /// How long a caller may wait for the database lock in degraded mode.
    pub fallback_lock_wait: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterSettings::default(),
            rate_limit_wait: Duration::from_millis(100),
            lock_wait: Duration::from_secs(3),
            lock_lease: Duration::from_secs(10),
            semaphore_wait: Duration::from_millis(500),
            semaphore_lifetime: Duration::from_secs(60),
            fallback_lock_wait: Duration::from_secs(3),
        }
    }
}

impl AdmissionSettings {
    /// Defaults overlaid with `SLOTGUARD_*` environment variables. Values that
    /// don't parse, or that every guard would refuse, fall back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |name: &str, default: Duration, accept: fn(Duration) -> bool| {
            lookup(name)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .filter(|d| accept(*d))
                .unwrap_or(default)
        };
        fn wait(d: Duration) -> bool {
            d <= MAX_WAIT
        }
        fn lifetime(d: Duration) -> bool {
            d >= MIN_LIFETIME
        }
        fn interval(d: Duration) -> bool {
            !d.is_zero() && d <= MAX_INTERVAL
        }

        let scope = match lookup("SLOTGUARD_RATE_SCOPE").as_deref() {
            Some("per_client") | Some("PER_CLIENT") => RateScope::PerClient,
            Some("whole") | Some("WHOLE") => RateScope::Whole,
            _ => d.rate_limiter.scope,
        };
        let permits_per_interval = lookup("SLOTGUARD_RATE_PERMITS")
            .and_then(|s| s.parse().ok())
            .filter(|p| *p > 0 && *p <= MAX_PERMITS_PER_INTERVAL)
            .unwrap_or(d.rate_limiter.permits_per_interval);

        Self {
            rate_limiter: RateLimiterSettings {
                scope,
                permits_per_interval,
                interval: ms("SLOTGUARD_RATE_INTERVAL_MS", d.rate_limiter.interval, interval),
                bucket_lifetime: ms("SLOTGUARD_RATE_BUCKET_LIFETIME_MS", d.rate_limiter.bucket_lifetime, lifetime),
            },
            rate_limit_wait: ms("SLOTGUARD_RATE_WAIT_MS", d.rate_limit_wait, wait),
            lock_wait: ms("SLOTGUARD_LOCK_WAIT_MS", d.lock_wait, wait),
            lock_lease: ms("SLOTGUARD_LOCK_LEASE_MS", d.lock_lease, lifetime),
            semaphore_wait: ms("SLOTGUARD_SEMAPHORE_WAIT_MS", d.semaphore_wait, wait),
            semaphore_lifetime: ms("SLOTGUARD_SEMAPHORE_LIFETIME_MS", d.semaphore_lifetime, lifetime),
            fallback_lock_wait: ms("SLOTGUARD_FALLBACK_LOCK_WAIT_MS", d.fallback_lock_wait, wait),
        }
    }
}
