use std::fmt;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type RestaurantId = u64;
pub type UserId = u64;
pub type CandidateId = u64;
pub type OccupancyId = u64;

/// Tag prefixed to every slot key so keys never collide with other users of
/// the coordination tier.
pub const SLOT_KEY_DOMAIN: &str = "occupancy";

/// Coordination key for one restaurant/date/start-time unit.
///
/// Format: `occupancy:<restaurant>:<YYYY-MM-DD>:<HH:MM:SS>`. The restaurant id
/// is decimal digits and date/time are fixed width, so distinct slots never
/// produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(restaurant_id: RestaurantId, date: NaiveDate, start_time: NaiveTime) -> Self {
        Self(format!(
            "{SLOT_KEY_DOMAIN}:{restaurant_id}:{}:{}",
            date.format("%Y-%m-%d"),
            start_time.format("%H:%M:%S"),
        ))
    }

    pub fn for_request(request: &ReservationRequest) -> Self {
        Self::new(request.restaurant_id, request.date, request.start_time)
    }

    /// Key scoped to a single client, used by `RateScope::PerClient` buckets.
    pub fn scoped_to(&self, client: &Ulid) -> String {
        format!("{}:client:{client}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SlotKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A request to occupy any free table at one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub restaurant_id: RestaurantId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

/// A bookable table/time-slot instance returned by the candidate loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,
    pub restaurant_id: RestaurantId,
    pub table_id: u64,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyStatus {
    Occupied,
    Unoccupied,
}

/// What the core hands to the occupancy writer once every guard is satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyRecord {
    pub candidate_id: CandidateId,
    pub restaurant_id: RestaurantId,
    pub table_id: u64,
    pub user_id: UserId,
    pub status: OccupancyStatus,
    pub occupied_at: NaiveDateTime,
    pub unoccupied_at: Option<NaiveDateTime>,
}

impl OccupancyRecord {
    pub fn occupied(candidate: &Candidate, user_id: UserId, now: NaiveDateTime) -> Self {
        Self {
            candidate_id: candidate.id,
            restaurant_id: candidate.restaurant_id,
            table_id: candidate.table_id,
            user_id,
            status: OccupancyStatus::Occupied,
            occupied_at: now,
            unoccupied_at: None,
        }
    }
}

/// Successful result of `AdmissionController::reserve`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub occupancy_id: OccupancyId,
    pub candidate_id: CandidateId,
    pub table_id: u64,
    pub key: SlotKey,
    /// True when mutual exclusion came from the fallback lock coordinator.
    pub degraded: bool,
}

/// Domain event published after an occupancy is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OccupancyEvent {
    Occupied {
        occupancy_id: OccupancyId,
        restaurant_id: RestaurantId,
        table_id: u64,
        user_id: UserId,
        key: SlotKey,
    },
}

impl OccupancyEvent {
    pub fn restaurant_id(&self) -> RestaurantId {
        match self {
            OccupancyEvent::Occupied { restaurant_id, .. } => *restaurant_id,
        }
    }
}

// ── Guard settings ───────────────────────────────────────────

/// Which callers share a rate-limiter bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateScope {
    /// One bucket per key across every process.
    Whole,
    /// One bucket per key per limiter instance.
    PerClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    pub scope: RateScope,
    pub permits_per_interval: u32,
    pub interval: Duration,
    /// Idle time after which the bucket is dropped.
    pub bucket_lifetime: Duration,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            scope: RateScope::Whole,
            permits_per_interval: 100,
            interval: Duration::from_secs(1),
            bucket_lifetime: Duration::from_secs(60),
        }
    }
}

/// Permit pool shape for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreSettings {
    pub capacity: u32,
    /// Idle time after which the pool is dropped (and any unreleased permits with it).
    pub lifetime: Duration,
}

/// How many permits one acquisition wants and how long it may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreInquiry {
    pub permits: u32,
    pub wait: Duration,
}
