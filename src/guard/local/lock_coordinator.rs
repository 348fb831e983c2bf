use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use crate::error::GuardError;
use crate::guard::{FallbackLockCoordinator, HeldLock};
use crate::limits::{validate_key, validate_wait};
use crate::model::SlotKey;

use super::LocalStore;

const NAMESPACE: &str = "named_lock";

/// Named-lock coordinator over process memory. Stands in for the database
/// coordinator in single-instance deployments and tests.
pub struct LocalLockCoordinator {
    store: Arc<LocalStore>,
}

impl LocalLockCoordinator {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }
}

struct LocalHeldLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl HeldLock for LocalHeldLock {
    async fn release(self: Box<Self>) -> Result<(), GuardError> {
        Ok(())
    }
}

#[async_trait]
impl FallbackLockCoordinator for LocalLockCoordinator {
    async fn try_lock(&self, key: &SlotKey, wait: Duration) -> Result<Option<Box<dyn HeldLock>>, GuardError> {
        validate_key(key.as_str())?;
        validate_wait(wait)?;

        let mutex = self
            .store
            .locks
            .entry(format!("{NAMESPACE}:{key}"))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone();
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(Some(Box::new(LocalHeldLock { _guard: guard }))),
            Err(_) => Ok(None),
        }
    }
}
