//! Storage boundary consumed by the booking engine.
//!
//! The engine never touches storage directly; every read and write goes through
//! [`Repository`]. Two adapters ship with the crate: [`InMemoryRepository`] and the
//! WAL-backed [`WalRepository`].
//!
//! Writes are conditional. Each adapter checks the write against the state it is
//! about to change (quota, provider existence, name ownership) in the same critical
//! section that applies it, and answers with a [`CommitOutcome`].

mod durable;
mod memory;

pub use durable::WalRepository;
pub use memory::InMemoryRepository;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    /// Transient failure of the backing store. Safe to retry.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result of a conditional write. Anything but `Committed` wrote nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The client already held `current` appointments.
    QuotaExceeded { current: u32 },
    ProviderMissing(Ulid),
    AppointmentMissing(Ulid),
    /// The provider still has Confirmed appointments.
    ProviderInUse(Ulid),
    /// Another provider already uses this name.
    NameTaken(String),
}

/// A write as the adapters see it, before it is checked against current state.
#[derive(Debug, Clone)]
enum Mutation {
    SaveProvider(Provider),
    DeleteProvider(Ulid),
    Book {
        appointment: Appointment,
        max_confirmed: Option<u32>,
    },
    Reschedule {
        id: Ulid,
        provider_id: Ulid,
        scheduled_at: Timestamp,
    },
    Cancel(Ulid),
}

impl Mutation {
    fn reschedule(appointment: &Appointment) -> Self {
        Mutation::Reschedule {
            id: appointment.id,
            provider_id: appointment.provider_id,
            scheduled_at: appointment.scheduled_at,
        }
    }
}

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    async fn find_provider(&self, id: Ulid) -> Result<Option<Provider>, RepositoryError>;

    async fn list_providers(&self) -> Result<Vec<Provider>, RepositoryError>;

    /// Insert or replace by id. `NameTaken` if another provider owns the name.
    async fn save_provider(&self, provider: Provider) -> Result<CommitOutcome, RepositoryError>;

    /// `ProviderMissing` if absent, `ProviderInUse` while any appointment references it.
    async fn delete_provider(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError>;

    /// Number of Confirmed appointments held by `client_id`.
    async fn count_confirmed(&self, client_id: Ulid) -> Result<u32, RepositoryError>;

    /// Insert `appointment` if its provider still exists. With `max_confirmed` set, the
    /// client's count and the insert happen atomically: if the client already holds
    /// `max_confirmed` or more, nothing is written and `QuotaExceeded` is returned.
    async fn insert_appointment(
        &self,
        appointment: Appointment,
        max_confirmed: Option<u32>,
    ) -> Result<CommitOutcome, RepositoryError>;

    async fn find_appointment(&self, id: Ulid) -> Result<Option<Appointment>, RepositoryError>;

    /// Matching appointments in ascending id order.
    async fn list_appointments(
        &self,
        filter: &AppointmentFilter,
    ) -> Result<Vec<Appointment>, RepositoryError>;

    /// Overwrite provider and time of an existing appointment. `AppointmentMissing` if it
    /// is gone, `ProviderMissing` if the target provider is.
    async fn replace_appointment(
        &self,
        appointment: Appointment,
    ) -> Result<CommitOutcome, RepositoryError>;

    /// `AppointmentMissing` if it did not exist.
    async fn delete_appointment(&self, id: Ulid) -> Result<CommitOutcome, RepositoryError>;
}
