//! Distributed guard tier on Redis.
//!
//! All state transitions run as Lua scripts so each check-and-update is atomic
//! on the server. Keys carry a `{slot}` hash tag, so the keys of one slot land
//! on the same cluster shard.

mod fair_lock;
mod rate_limiter;
mod semaphore;

pub use fair_lock::RedisFairLock;
pub use rate_limiter::RedisRateLimiter;
pub use semaphore::RedisSemaphore;

use ::redis::aio::ConnectionManager;
use ::redis::Client;

use crate::error::GuardError;

/// Open a managed connection. `ConnectionManager` reconnects on its own; a
/// call made while it is down surfaces as `GuardError::Unavailable`.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, GuardError> {
    let client = Client::open(redis_url)
        .map_err(|e| GuardError::Backend(format!("invalid redis url: {e}")))?;
    ConnectionManager::new(client).await.map_err(GuardError::from)
}

/// `prefix:{key}` with the slot key as cluster hash tag.
pub(crate) fn tagged(prefix: &str, key: &str) -> String {
    format!("{prefix}:{{{key}}}")
}
