//! Admission control for contended reservation slots.
//!
//! Requests for the same restaurant/date/start-time pass a rate limiter, a
//! FIFO lock and a capacity semaphore before one free table is persisted.
//! Guards come in a single-process tier (`guard::local`), a Redis tier
//! (`guard::redis`) and a Postgres advisory-lock fallback used when Redis is
//! unreachable.

pub mod admission;
pub mod config;
pub mod error;
pub mod flags;
pub mod guard;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ports;
pub mod reaper;
pub mod store;

pub use admission::AdmissionController;
pub use config::AdmissionSettings;
pub use error::{AdmissionError, GuardError, StoreError};
pub use guard::{DegradedGuards, Guards, LocalStore};
pub use model::{Candidate, OccupancyEvent, OccupancyRecord, Reservation, ReservationRequest, SlotKey};
