//! Appointment booking engine: weekly provider calendars, a per-client quota on
//! Confirmed appointments, and ownership-checked reschedule and cancellation.
//!
//! [`engine::BookingService`] is the entry point. Storage is reached only through
//! [`repository::Repository`]; the crate ships an in-memory adapter and a
//! WAL-backed durable one.

pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod repository;
pub mod wal;
