//! Feature switches checked before admission.

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::GuardError;

/// Flag gating `AdmissionController::reserve`.
pub const RESERVATION_FLAG: &str = "reservation";

/// A flag that was never set counts as enabled.
#[async_trait]
pub trait FeatureFlags: Send + Sync {
    async fn is_enabled(&self, flag: &str) -> Result<bool, GuardError>;
}

#[derive(Default)]
pub struct LocalFeatureFlags {
    flags: DashMap<String, bool>,
}

impl LocalFeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: &str, enabled: bool) {
        self.flags.insert(flag.to_string(), enabled);
    }
}

#[async_trait]
impl FeatureFlags for LocalFeatureFlags {
    async fn is_enabled(&self, flag: &str) -> Result<bool, GuardError> {
        Ok(self.flags.get(flag).is_none_or(|e| *e.value()))
    }
}

/// Flags stored as `feature_flag:<name>` string keys. Anything other than
/// `0`, `false` or `off` is enabled.
#[derive(Clone)]
pub struct RedisFeatureFlags {
    conn: ConnectionManager,
}

impl RedisFeatureFlags {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn parse_flag(value: Option<&str>) -> bool {
    !matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("0" | "false" | "off")
    )
}

#[async_trait]
impl FeatureFlags for RedisFeatureFlags {
    async fn is_enabled(&self, flag: &str) -> Result<bool, GuardError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(format!("feature_flag:{flag}")).await?;
        Ok(parse_flag(value.as_deref()))
    }
}
