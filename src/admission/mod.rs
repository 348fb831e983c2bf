//! The reservation admission path.
//!
//! A reservation passes, in order: the feature flag, the rate limiter, the
//! fair lock (or the database lock when the distributed tier is unreachable),
//! the candidate query, the capacity semaphore and finally the occupancy
//! writer. Every guard that was acquired is released on every exit path.

mod scope;

pub use scope::{Locked, with_fair_lock, with_fallback_lock};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::config::AdmissionSettings;
use crate::error::AdmissionError;
use crate::flags::{FeatureFlags, RESERVATION_FLAG};
use crate::guard::{Guards, Semaphore};
use crate::limits::MAX_PERMITS;
use crate::model::{
    Candidate, OccupancyEvent, OccupancyId, OccupancyRecord, Reservation, ReservationRequest,
    SemaphoreInquiry, SemaphoreSettings, SlotKey,
};
use crate::observability::{ADMISSIONS_TOTAL, ADMISSION_DURATION_SECONDS, FALLBACK_TOTAL};
use crate::ports::{CandidateLoader, OccupancyPublisher, OccupancyWriter};
use scope::{Compensation, release_permits};

/// Admits reservation requests for contended slots.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct AdmissionController {
    guards: Guards,
    candidates: Arc<dyn CandidateLoader>,
    writer: Arc<dyn OccupancyWriter>,
    publisher: Option<Arc<dyn OccupancyPublisher>>,
    flags: Option<Arc<dyn FeatureFlags>>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    pub fn new(
        guards: Guards,
        candidates: Arc<dyn CandidateLoader>,
        writer: Arc<dyn OccupancyWriter>,
        settings: AdmissionSettings,
    ) -> Self {
        Self {
            guards,
            candidates,
            writer,
            publisher: None,
            flags: None,
            settings,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn OccupancyPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_flags(mut self, flags: Arc<dyn FeatureFlags>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Reserve the lowest-id free table for the requested slot.
    pub async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, AdmissionError> {
        let started = Instant::now();
        let result = self.admit(request).await;
        let outcome = match &result {
            Ok(r) if r.degraded => "reserved_degraded",
            Ok(_) => "reserved",
            Err(e) => e.kind(),
        };
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(ADMISSION_DURATION_SECONDS, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn admit(&self, request: &ReservationRequest) -> Result<Reservation, AdmissionError> {
        self.check_enabled().await?;

        let key = SlotKey::for_request(request);
        self.take_rate_permit(&key).await?;

        let primary = with_fair_lock(&self.guards.fair_lock, &key, self.settings.lock_wait, || {
            self.occupy(request, &key)
        })
        .await;

        let (occupancy_id, candidate, degraded) = match primary {
            Locked::Completed(result) => {
                let (id, candidate) = result?;
                (id, candidate, false)
            }
            Locked::Unreachable(e) => {
                let Some(coordinator) = &self.guards.degraded.lock else {
                    warn!(key = %key, error = %e, "fair lock unreachable and no fallback configured");
                    return Err(e.into());
                };
                warn!(key = %key, error = %e, "fair lock unreachable, using database lock");
                metrics::counter!(FALLBACK_TOTAL, "guard" => "lock").increment(1);
                let (id, candidate) =
                    with_fallback_lock(coordinator, &key, self.settings.fallback_lock_wait, || {
                        self.occupy(request, &key)
                    })
                    .await?;
                (id, candidate, true)
            }
        };

        info!(
            key = %key,
            user_id = request.user_id,
            table_id = candidate.table_id,
            occupancy_id,
            degraded,
            "reserved"
        );
        if let Some(publisher) = &self.publisher {
            publisher.publish(&OccupancyEvent::Occupied {
                occupancy_id,
                restaurant_id: candidate.restaurant_id,
                table_id: candidate.table_id,
                user_id: request.user_id,
                key: key.clone(),
            });
        }

        Ok(Reservation {
            occupancy_id,
            candidate_id: candidate.id,
            table_id: candidate.table_id,
            key,
            degraded,
        })
    }

    /// Unset flags are enabled; a flag backend that cannot answer lets the
    /// request through.
    async fn check_enabled(&self) -> Result<(), AdmissionError> {
        let Some(flags) = &self.flags else { return Ok(()) };
        match flags.is_enabled(RESERVATION_FLAG).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AdmissionError::FeatureDisabled),
            Err(e) => {
                warn!(error = %e, "feature flag lookup failed, admitting");
                Ok(())
            }
        }
    }

    async fn take_rate_permit(&self, key: &SlotKey) -> Result<(), AdmissionError> {
        let wait = self.settings.rate_limit_wait;
        let settings = &self.settings.rate_limiter;
        let admitted = match self.guards.rate_limiter.try_acquire(key, wait, settings).await {
            Err(e) if e.is_unavailable() => {
                let Some(fallback) = &self.guards.degraded.rate_limiter else {
                    return Err(e.into());
                };
                warn!(key = %key, error = %e, "rate limiter unreachable, using local bucket");
                metrics::counter!(FALLBACK_TOTAL, "guard" => "rate_limiter").increment(1);
                fallback.try_acquire(key, wait, settings).await?
            }
            other => other?,
        };
        if admitted {
            Ok(())
        } else {
            debug!(key = %key, "rate limited");
            Err(AdmissionError::RateLimited)
        }
    }

    /// Runs inside the mutual-exclusion section.
    async fn occupy(
        &self,
        request: &ReservationRequest,
        key: &SlotKey,
    ) -> Result<(OccupancyId, Candidate), AdmissionError> {
        let mut candidates = self
            .candidates
            .query(request.restaurant_id, request.date, request.start_time)
            .await?;
        if candidates.is_empty() {
            return Err(AdmissionError::NoCandidates);
        }

        let permits = u32::try_from(candidates.len()).unwrap_or(u32::MAX).min(MAX_PERMITS);
        let semaphore = self.acquire_permits(key, permits).await?;
        let permit = Compensation::new(release_permits(semaphore, key.clone()));

        candidates.sort_by_key(|c| c.id);
        let result = self.persist_first(request, &candidates).await;
        permit.run().await;
        result
    }

    /// Returns the semaphore that actually granted, so release goes to it.
    async fn acquire_permits(&self, key: &SlotKey, permits: u32) -> Result<Arc<dyn Semaphore>, AdmissionError> {
        let settings = SemaphoreSettings {
            capacity: permits,
            lifetime: self.settings.semaphore_lifetime,
        };
        let inquiry = SemaphoreInquiry {
            permits,
            wait: self.settings.semaphore_wait,
        };

        let started = Instant::now();
        let primary = &self.guards.semaphore;
        let granted = match primary.try_acquire(key, &settings, &inquiry).await {
            Ok(granted) => granted.then(|| primary.clone()),
            Err(e) if e.is_unavailable() => {
                let Some(fallback) = &self.guards.degraded.semaphore else {
                    return Err(e.into());
                };
                warn!(key = %key, error = %e, "semaphore unreachable, using local pool");
                metrics::counter!(FALLBACK_TOTAL, "guard" => "semaphore").increment(1);
                fallback
                    .try_acquire(key, &settings, &inquiry)
                    .await?
                    .then(|| fallback.clone())
            }
            Err(e) => return Err(e.into()),
        };
        metrics::histogram!(crate::observability::GUARD_WAIT_SECONDS, "guard" => "semaphore")
            .record(started.elapsed().as_secs_f64());

        granted.ok_or(AdmissionError::CapacityExhausted)
    }

    /// Try candidates in ascending id order; the first one the writer accepts
    /// wins. A writer error stops the walk.
    async fn persist_first(
        &self,
        request: &ReservationRequest,
        candidates: &[Candidate],
    ) -> Result<(OccupancyId, Candidate), AdmissionError> {
        let now = chrono::Utc::now().naive_utc();
        for candidate in candidates {
            let record = OccupancyRecord::occupied(candidate, request.user_id, now);
            match self.writer.create(&record).await? {
                Some(id) => return Ok((id, candidate.clone())),
                None => debug!(candidate_id = candidate.id, "candidate not taken, trying next"),
            }
        }
        Err(AdmissionError::NoCandidates)
    }
}
