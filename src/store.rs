use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;

use crate::error::StoreError;
use crate::model::*;
use crate::ports::{CandidateLoader, OccupancyWriter};

struct SlotRow {
    candidate: Candidate,
    occupancy: Option<OccupancyId>,
}

/// In-memory slot table implementing both collaborator ports. Candidates are
/// grouped by slot key; an occupied candidate is no longer returned by
/// `query` and a second `create` on it is a soft failure.
pub struct InMemorySlots {
    slots: DashMap<SlotKey, Vec<SlotRow>>,
    occupancies: Mutex<Vec<OccupancyRecord>>,
    next_id: AtomicU64,
}

impl Default for InMemorySlots {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySlots {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            occupancies: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_candidate(&self, candidate: Candidate) {
        let key = SlotKey::new(candidate.restaurant_id, candidate.date, candidate.start_time);
        self.slots.entry(key).or_default().push(SlotRow {
            candidate,
            occupancy: None,
        });
    }

    /// Add one candidate per table for a slot, with ids `first_id..`.
    pub fn add_tables(
        &self,
        restaurant_id: RestaurantId,
        date: NaiveDate,
        start_time: NaiveTime,
        first_id: CandidateId,
        tables: u64,
    ) {
        for n in 0..tables {
            self.add_candidate(Candidate {
                id: first_id + n,
                restaurant_id,
                table_id: n + 1,
                date,
                start_time,
            });
        }
    }

    pub fn occupancies(&self) -> Vec<OccupancyRecord> {
        self.occupancies
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn occupancy_count(&self) -> usize {
        self.occupancies.lock().map(|o| o.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CandidateLoader for InMemorySlots {
    async fn query(
        &self,
        restaurant_id: RestaurantId,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Vec<Candidate>, StoreError> {
        let key = SlotKey::new(restaurant_id, date, start_time);
        Ok(self
            .slots
            .get(&key)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.occupancy.is_none())
                    .map(|r| r.candidate.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl OccupancyWriter for InMemorySlots {
    async fn create(&self, record: &OccupancyRecord) -> Result<Option<OccupancyId>, StoreError> {
        let Some(slot) = self.slots.iter().find_map(|entry| {
            entry
                .value()
                .iter()
                .any(|r| r.candidate.id == record.candidate_id)
                .then(|| entry.key().clone())
        }) else {
            return Err(StoreError::Other(format!("unknown candidate {}", record.candidate_id)));
        };

        let mut rows = self
            .slots
            .get_mut(&slot)
            .ok_or_else(|| StoreError::Other(format!("slot vanished: {slot}")))?;
        let Some(row) = rows.iter_mut().find(|r| r.candidate.id == record.candidate_id) else {
            return Err(StoreError::Other(format!("unknown candidate {}", record.candidate_id)));
        };
        if row.occupancy.is_some() {
            return Ok(None);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        row.occupancy = Some(id);
        drop(rows);

        self.occupancies
            .lock()
            .map_err(|_| StoreError::Other("occupancy log poisoned".into()))?
            .push(record.clone());
        Ok(Some(id))
    }
}
