mod availability;
mod eligibility;
mod error;
mod ledger;

pub use availability::{WindowError, is_open, validate_availability_set};
pub use eligibility::{Decision, evaluate};
pub use error::{BookingError, Entity};
pub use ledger::AppointmentLedger;

use std::io;
use std::sync::Arc;

use chrono::Local;
use tracing::{debug, info};
use ulid::Ulid;

use crate::config::Config;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::repository::{Repository, WalRepository};

/// The outward-facing booking surface. Every operation takes an already
/// authenticated [`Actor`]; identity never comes from the request body.
pub struct BookingService<R> {
    ledger: AppointmentLedger<R>,
}

impl BookingService<WalRepository> {
    /// Open (or create) the booking log under `config.data_dir` and replay it.
    /// Must be called from within a tokio runtime.
    pub fn open(config: &Config) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let repo = WalRepository::open(&config.wal_path(), config.compact_threshold)?;
        Ok(Self::new(Arc::new(repo), config))
    }
}

impl<R: Repository> BookingService<R> {
    pub fn new(repo: Arc<R>, config: &Config) -> Self {
        Self {
            ledger: AppointmentLedger::new(repo, config),
        }
    }

    pub fn ledger(&self) -> &AppointmentLedger<R> {
        &self.ledger
    }

    // ── Appointments ─────────────────────────────────────────────

    /// Book `request` for the calling actor. The client is always the actor.
    pub async fn propose_appointment(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Appointment, BookingError> {
        let result = self.propose(actor, request).await;
        record("propose_appointment", &result);
        result
    }

    async fn propose(
        &self,
        actor: &Actor,
        request: BookingRequest,
    ) -> Result<Appointment, BookingError> {
        let appointment = Appointment {
            id: Ulid::new(),
            client_id: actor.id,
            provider_id: request.provider_id,
            scheduled_at: request.requested_at,
            created_at: Local::now().naive_local(),
        };
        self.ledger.create(actor, appointment.clone()).await?;
        info!(
            appointment = %appointment.id,
            client = %appointment.client_id,
            provider = %appointment.provider_id,
            at = %appointment.scheduled_at,
            "appointment booked"
        );
        Ok(appointment)
    }

    pub async fn get_appointment(&self, actor: &Actor, id: Ulid) -> Result<Appointment, BookingError> {
        let result = async {
            let appointment = self.ledger.get(id).await?;
            if !actor.may_access(&appointment) {
                return Err(BookingError::Forbidden {
                    actor: actor.id,
                    action: "view this appointment",
                });
            }
            Ok(appointment)
        }
        .await;
        record("get_appointment", &result);
        result
    }

    /// All appointments for administrators, the actor's own otherwise.
    pub async fn list_appointments(&self, actor: &Actor) -> Result<Vec<Appointment>, BookingError> {
        let result = self.ledger.list_for(actor).await;
        record("list_appointments", &result);
        result
    }

    pub async fn list_provider_appointments(
        &self,
        actor: &Actor,
        provider_id: Ulid,
    ) -> Result<Vec<Appointment>, BookingError> {
        let result = async {
            self.ledger.provider(provider_id).await?;
            self.ledger.list_for_provider(actor, provider_id).await
        }
        .await;
        record("list_provider_appointments", &result);
        result
    }

    pub async fn reschedule_appointment(
        &self,
        actor: &Actor,
        id: Ulid,
        change: AppointmentUpdate,
    ) -> Result<Appointment, BookingError> {
        let result = self.ledger.update(id, actor, &change).await;
        if let Ok(appointment) = &result
            && !change.is_empty()
        {
            info!(
                appointment = %id,
                provider = %appointment.provider_id,
                at = %appointment.scheduled_at,
                "appointment rescheduled"
            );
        }
        record("reschedule_appointment", &result);
        result
    }

    pub async fn cancel_appointment(&self, actor: &Actor, id: Ulid) -> Result<(), BookingError> {
        let result = self.ledger.cancel(id, actor).await;
        if result.is_ok() {
            info!(appointment = %id, actor = %actor.id, "appointment cancelled");
        }
        record("cancel_appointment", &result);
        result
    }

    // ── Providers ────────────────────────────────────────────────

    /// Create a provider (`id` None) or replace an existing one. Administrators only.
    pub async fn upsert_provider(
        &self,
        actor: &Actor,
        id: Option<Ulid>,
        draft: ProviderDraft,
    ) -> Result<Provider, BookingError> {
        let result = self.upsert(actor, id, draft).await;
        record("upsert_provider", &result);
        result
    }

    async fn upsert(
        &self,
        actor: &Actor,
        id: Option<Ulid>,
        draft: ProviderDraft,
    ) -> Result<Provider, BookingError> {
        require_privileged(actor)?;
        validate_draft(&draft)?;
        let id = match id {
            Some(id) => self.ledger.provider(id).await?.id,
            None => Ulid::new(),
        };
        let provider = draft.into_provider(id);
        let repo = self.ledger.repository();
        let outcome = self
            .ledger
            .call("save_provider", repo.save_provider(provider.clone()))
            .await?;
        self.ledger.settle(outcome)?;
        info!(
            provider = %provider.id,
            name = %provider.name,
            windows = provider.availability.len(),
            "provider saved"
        );
        Ok(provider)
    }

    pub async fn get_provider(&self, id: Ulid) -> Result<Provider, BookingError> {
        let result = self.ledger.provider(id).await;
        record("get_provider", &result);
        result
    }

    /// Every provider, sorted by name.
    pub async fn list_providers(&self) -> Result<Vec<Provider>, BookingError> {
        let repo = self.ledger.repository();
        let result = self
            .ledger
            .call("list_providers", repo.list_providers())
            .await;
        record("list_providers", &result);
        result
    }

    /// Remove a provider with no Confirmed appointments. Administrators only.
    /// The in-use check and the delete are one atomic step in the repository.
    pub async fn delete_provider(&self, actor: &Actor, id: Ulid) -> Result<(), BookingError> {
        let result = async {
            require_privileged(actor)?;
            let repo = self.ledger.repository();
            let outcome = self
                .ledger
                .call("delete_provider", repo.delete_provider(id))
                .await?;
            self.ledger.settle(outcome)?;
            info!(provider = %id, "provider deleted");
            Ok(())
        }
        .await;
        record("delete_provider", &result);
        result
    }
}

impl BookingRequest {
    /// Parse a JSON booking body. Any malformed field is `InvalidRequest`.
    pub fn from_json(body: &[u8]) -> Result<Self, BookingError> {
        serde_json::from_slice(body).map_err(|e| {
            debug!("rejected booking body: {e}");
            BookingError::InvalidRequest("booking body must carry provider_id and requested_at")
        })
    }
}

impl AppointmentUpdate {
    pub fn from_json(body: &[u8]) -> Result<Self, BookingError> {
        serde_json::from_slice(body).map_err(|e| {
            debug!("rejected reschedule body: {e}");
            BookingError::InvalidRequest("reschedule body must carry scheduled_at or provider_id")
        })
    }
}

fn require_privileged(actor: &Actor) -> Result<(), BookingError> {
    if actor.is_privileged() {
        return Ok(());
    }
    Err(BookingError::Forbidden {
        actor: actor.id,
        action: "manage providers",
    })
}

fn validate_draft(draft: &ProviderDraft) -> Result<(), BookingError> {
    let name = draft.name.trim().chars().count();
    if name == 0 || name > MAX_NAME_LEN {
        return Err(BookingError::InvalidRequest("provider name must be 1-50 characters"));
    }
    let specialty = draft.specialty.trim().chars().count();
    if specialty == 0 || specialty > MAX_SPECIALTY_LEN {
        return Err(BookingError::InvalidRequest("specialty must be 1-100 characters"));
    }
    validate_availability_set(&draft.availability)?;
    Ok(())
}

fn record<T>(operation: &'static str, result: &Result<T, BookingError>) {
    let outcome = observability::outcome_label(result);
    metrics::counter!(observability::REQUESTS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
    if let Err(e) = result {
        debug!(operation, outcome, "request rejected: {e}");
    }
}
