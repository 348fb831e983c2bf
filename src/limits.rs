use std::time::Duration;

use crate::error::GuardError;

pub const MAX_KEY_LEN: usize = 256;
pub const MAX_WAIT: Duration = Duration::from_secs(30);
pub const MAX_PERMITS: u32 = 10_000;
pub const MAX_PERMITS_PER_INTERVAL: u32 = 1_000_000;
pub const MIN_LIFETIME: Duration = Duration::from_millis(1);
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) fn validate_key(key: &str) -> Result<(), GuardError> {
    if key.is_empty() {
        return Err(GuardError::Invalid("empty key"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(GuardError::Invalid("key too long"));
    }
    Ok(())
}

pub(crate) fn validate_wait(wait: Duration) -> Result<(), GuardError> {
    if wait > MAX_WAIT {
        return Err(GuardError::Invalid("wait too long"));
    }
    Ok(())
}

pub(crate) fn validate_rate(
    permits_per_interval: u32,
    interval: Duration,
    lifetime: Duration,
) -> Result<(), GuardError> {
    if permits_per_interval == 0 {
        return Err(GuardError::Invalid("permits per interval must be positive"));
    }
    if permits_per_interval > MAX_PERMITS_PER_INTERVAL {
        return Err(GuardError::Invalid("permits per interval too large"));
    }
    if interval.is_zero() {
        return Err(GuardError::Invalid("interval must be positive"));
    }
    if interval > MAX_INTERVAL {
        return Err(GuardError::Invalid("interval too long"));
    }
    if lifetime < MIN_LIFETIME {
        return Err(GuardError::Invalid("bucket lifetime too short"));
    }
    Ok(())
}

pub(crate) fn validate_permits(permits: u32, capacity: u32) -> Result<(), GuardError> {
    if permits == 0 {
        return Err(GuardError::Invalid("permits must be positive"));
    }
    if permits > MAX_PERMITS || capacity > MAX_PERMITS {
        return Err(GuardError::Invalid("too many permits"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized_keys() {
        assert_eq!(validate_key(""), Err(GuardError::Invalid("empty key")));
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key("occupancy:1:2024-01-01:12:00:00").is_ok());
    }

    #[test]
    fn rejects_degenerate_rates() {
        let s = Duration::from_secs(1);
        assert!(validate_rate(0, s, s).is_err());
        assert!(validate_rate(1, Duration::ZERO, s).is_err());
        assert!(validate_rate(1, s, Duration::ZERO).is_err());
        assert!(validate_rate(10, s, s).is_ok());
    }

    #[test]
    fn rejects_intervals_beyond_a_day() {
        let s = Duration::from_secs(1);
        assert!(validate_rate(1, MAX_INTERVAL, s).is_ok());
        assert_eq!(
            validate_rate(1, MAX_INTERVAL + s, s),
            Err(GuardError::Invalid("interval too long"))
        );
        assert!(validate_rate(1, Duration::MAX, s).is_err());
    }
}
