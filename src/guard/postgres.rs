//! Database-backed named lock for degraded mode.
//!
//! Each acquisition opens its own connection, starts a SERIALIZABLE
//! transaction, bounds the wait with `lock_timeout` and takes a session
//! advisory lock on a 64-bit hash of the slot key. Release unlocks and
//! commits; closing the connection frees the lock even if release never runs.
//!
//! The lock session is never shared with the `OccupancyWriter`. The guarded
//! work runs on the writer's own connection, so the transaction here only
//! scopes `lock_timeout` to the lock session. Mutual exclusion comes from the
//! advisory lock alone, which every session sees.

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, warn};

use crate::error::GuardError;
use crate::guard::{duration_ms, FallbackLockCoordinator, HeldLock};
use crate::limits::{validate_key, validate_wait};
use crate::model::SlotKey;

const LOCK_SQL: &str = "SELECT pg_advisory_lock(hashtextextended($1, 0))";
const UNLOCK_SQL: &str = "SELECT pg_advisory_unlock(hashtextextended($1, 0))";

pub struct PgLockCoordinator {
    config: Config,
}

impl PgLockCoordinator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Parse a `postgres://` URL or key/value connection string.
    pub fn from_url(url: &str) -> Result<Self, GuardError> {
        let config = url
            .parse::<Config>()
            .map_err(|_| GuardError::Invalid("invalid postgres connection string"))?;
        Ok(Self::new(config))
    }

    async fn connect(&self) -> Result<Client, GuardError> {
        let (client, conn) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("fallback lock connection closed: {e}");
            }
        });
        Ok(client)
    }
}

struct PgHeldLock {
    client: Client,
    key: String,
}

#[async_trait]
impl HeldLock for PgHeldLock {
    async fn release(self: Box<Self>) -> Result<(), GuardError> {
        let unlocked = self.client.query_one(UNLOCK_SQL, &[&self.key]).await;
        let committed = self.client.batch_execute("COMMIT").await;
        match (unlocked, committed) {
            (Ok(row), Ok(())) => {
                let released: bool = row.get(0);
                if !released {
                    warn!(key = %self.key, "advisory lock was not held at release");
                }
                Ok(())
            }
            (Err(e), _) | (_, Err(e)) => Err(GuardError::from(e)),
        }
    }
}

#[async_trait]
impl FallbackLockCoordinator for PgLockCoordinator {
    async fn try_lock(&self, key: &SlotKey, wait: Duration) -> Result<Option<Box<dyn HeldLock>>, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(wait)?;

        let client = self.connect().await?;
        // lock_timeout = 0 would mean "wait forever"
        let timeout_ms = duration_ms(wait).max(1);
        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL SERIALIZABLE; SET LOCAL lock_timeout = '{timeout_ms}ms'"
            ))
            .await?;

        match client.query_one(LOCK_SQL, &[&key.as_str()]).await {
            Ok(_) => Ok(Some(Box::new(PgHeldLock {
                client,
                key: key.as_str().to_string(),
            }))),
            Err(e) if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) => {
                debug!(key = %key, "database lock wait elapsed");
                // Nothing was locked; dropping the client rolls the transaction back.
                if let Err(e) = client.batch_execute("ROLLBACK").await {
                    debug!(key = %key, "rollback after lock wait failed: {e}");
                }
                Ok(None)
            }
            Err(e) => Err(GuardError::from(e)),
        }
    }
}
