//! Collaborators the admission core calls but does not own.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};

use crate::error::StoreError;
use crate::model::{Candidate, OccupancyEvent, OccupancyId, OccupancyRecord, RestaurantId};

/// Returns the currently bookable candidates for one slot.
#[async_trait]
pub trait CandidateLoader: Send + Sync {
    async fn query(
        &self,
        restaurant_id: RestaurantId,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Vec<Candidate>, StoreError>;
}

/// Persists an occupancy. `Ok(None)` means the candidate could not be taken
/// (for instance it was occupied meanwhile) without anything going wrong.
#[async_trait]
pub trait OccupancyWriter: Send + Sync {
    async fn create(&self, record: &OccupancyRecord) -> Result<Option<OccupancyId>, StoreError>;
}

/// Receives domain events after a successful reservation. Best effort.
pub trait OccupancyPublisher: Send + Sync {
    fn publish(&self, event: &OccupancyEvent);
}
