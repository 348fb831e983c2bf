use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use slotguard::error::{GuardError, StoreError};
use slotguard::guard::{
    DegradedGuards, FairLock, Guards, LocalFairLock, LocalLockCoordinator, LocalStore, RateLimiter, Semaphore,
};
use slotguard::model::*;
use slotguard::ports::{CandidateLoader, OccupancyWriter};
use slotguard::store::InMemorySlots;
use slotguard::{AdmissionController, AdmissionError, AdmissionSettings};

// ── Test infrastructure ──────────────────────────────────────

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 2, 14).unwrap()
}

fn time() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).unwrap()
}

fn request(user_id: u64) -> ReservationRequest {
    ReservationRequest {
        restaurant_id: 9,
        user_id,
        date: date(),
        start_time: time(),
    }
}

/// Counts how many callers are between candidate load and persist at once.
struct Watched {
    slots: InMemorySlots,
    inside: AtomicUsize,
    max_inside: AtomicUsize,
}

impl Watched {
    fn new(tables: u64) -> Arc<Self> {
        let slots = InMemorySlots::new();
        slots.add_tables(9, date(), time(), 1, tables);
        Arc::new(Self {
            slots,
            inside: AtomicUsize::new(0),
            max_inside: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CandidateLoader for Watched {
    async fn query(&self, restaurant_id: u64, date: NaiveDate, start_time: NaiveTime) -> Result<Vec<Candidate>, StoreError> {
        let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inside.fetch_max(now, Ordering::SeqCst);
        let candidates = self.slots.query(restaurant_id, date, start_time).await;
        if candidates.as_ref().is_ok_and(|c| c.is_empty()) {
            self.inside.fetch_sub(1, Ordering::SeqCst);
        }
        candidates
    }
}

#[async_trait]
impl OccupancyWriter for Watched {
    async fn create(&self, record: &OccupancyRecord) -> Result<Option<OccupancyId>, StoreError> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let id = self.slots.create(record).await;
        self.inside.fetch_sub(1, Ordering::SeqCst);
        id
    }
}

/// Guard whose backend is down for every call.
struct Unreachable;

#[async_trait]
impl RateLimiter for Unreachable {
    async fn try_acquire(&self, _: &SlotKey, _: Duration, _: &RateLimiterSettings) -> Result<bool, GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl Semaphore for Unreachable {
    async fn try_acquire(&self, _: &SlotKey, _: &SemaphoreSettings, _: &SemaphoreInquiry) -> Result<bool, GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }

    async fn release(&self, _: &SlotKey) -> Result<(), GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl FairLock for Unreachable {
    async fn try_lock(&self, _: &SlotKey, _: Ulid, _: Duration) -> Result<bool, GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }

    async fn is_held_by(&self, _: &SlotKey, _: Ulid) -> Result<bool, GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }

    async fn unlock(&self, _: &SlotKey, _: Ulid) -> Result<bool, GuardError> {
        Err(GuardError::Unavailable("connection refused".into()))
    }
}

fn settings() -> AdmissionSettings {
    let mut settings = AdmissionSettings {
        lock_wait: Duration::from_secs(5),
        fallback_lock_wait: Duration::from_secs(5),
        semaphore_wait: Duration::from_millis(100),
        ..AdmissionSettings::default()
    };
    settings.rate_limiter.permits_per_interval = 10_000;
    settings
}

async fn storm(controller: Arc<AdmissionController>, callers: u64) -> Vec<Result<Reservation, AdmissionError>> {
    let handles: Vec<_> = (0..callers)
        .map(|user| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.reserve(&request(user)).await })
        })
        .collect();
    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_winner_per_table_under_contention() {
    let store = Arc::new(LocalStore::new());
    let slots = Watched::new(5);
    let controller = Arc::new(AdmissionController::new(
        Guards::local(store.clone()),
        slots.clone(),
        slots.clone(),
        settings(),
    ));

    let results = storm(controller, 40).await;
    let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 5);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(*err, AdmissionError::NoCandidates);
    }

    let mut tables: Vec<u64> = won.iter().map(|r| r.table_id).collect();
    tables.sort();
    assert_eq!(tables, vec![1, 2, 3, 4, 5]);
    assert_eq!(slots.max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(slots.slots.occupancy_count(), 5);

    // No guard left held
    assert_eq!(store.held_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fallback_still_excludes() {
    let store = Arc::new(LocalStore::new());
    let slots = Watched::new(3);
    let mut guards = Guards::local(store.clone()).with_degraded(DegradedGuards {
        lock: Some(Arc::new(LocalLockCoordinator::new(store.clone()))),
        ..DegradedGuards::default()
    });
    guards.fair_lock = Arc::new(Unreachable);
    let controller = Arc::new(AdmissionController::new(guards, slots.clone(), slots.clone(), settings()));

    let results = storm(controller, 20).await;
    let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 3);
    assert!(won.iter().all(|r| r.degraded));
    assert_eq!(slots.max_inside.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn whole_primary_tier_down_runs_on_local_substitutes() {
    let store = Arc::new(LocalStore::new());
    let slots = Watched::new(2);
    let unreachable = Arc::new(Unreachable);
    let guards = Guards {
        rate_limiter: unreachable.clone(),
        fair_lock: unreachable.clone(),
        semaphore: unreachable,
        degraded: DegradedGuards::local(Arc::new(LocalLockCoordinator::new(store.clone())), store.clone()),
    };
    let controller = Arc::new(AdmissionController::new(guards, slots.clone(), slots.clone(), settings()));

    let results = storm(controller, 10).await;
    let won: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(won.len(), 2);
    assert!(won.iter().all(|r| r.degraded));
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert_eq!(*err, AdmissionError::NoCandidates);
    }
    assert_eq!(slots.max_inside.load(Ordering::SeqCst), 1);

    // The substitutes kept their state in the shared store
    assert_eq!(store.bucket_count(), 1);
    assert_eq!(store.pool_count(), 1);
}

#[tokio::test]
async fn every_guard_wait_is_bounded() {
    let store = Arc::new(LocalStore::new());
    let slots = Watched::new(1);
    let settings = AdmissionSettings {
        lock_wait: Duration::from_millis(150),
        ..settings()
    };
    let controller = AdmissionController::new(Guards::local(store.clone()), slots.clone(), slots.clone(), settings);

    // Someone else sits on the lock for the whole test
    let lock = LocalFairLock::new(store.clone());
    let key = SlotKey::for_request(&request(0));
    assert!(lock.try_lock(&key, Ulid::new(), Duration::ZERO).await.unwrap());

    for user in 0..3 {
        let started = Instant::now();
        let err = controller.reserve(&request(user)).await.unwrap_err();
        assert_eq!(err, AdmissionError::LockContention);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}

#[tokio::test]
async fn other_slots_do_not_contend() {
    let store = Arc::new(LocalStore::new());
    let slots = Watched::new(1);
    let later = NaiveTime::from_hms_opt(22, 0, 0).unwrap();
    slots.slots.add_tables(9, date(), later, 100, 1);
    let controller = AdmissionController::new(Guards::local(store.clone()), slots.clone(), slots.clone(), settings());

    let lock = LocalFairLock::new(store.clone());
    assert!(
        lock.try_lock(&SlotKey::for_request(&request(0)), Ulid::new(), Duration::ZERO)
            .await
            .unwrap()
    );

    let other = ReservationRequest {
        start_time: later,
        ..request(1)
    };
    let reservation = controller.reserve(&other).await.unwrap();
    assert_eq!(reservation.candidate_id, 100);
}
