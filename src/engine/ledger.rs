use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::{Config, RescheduleQuota};
use crate::model::*;
use crate::observability;
use crate::repository::{CommitOutcome, Repository, RepositoryError};

use super::availability::is_open;
use super::eligibility::{Decision, evaluate};
use super::BookingError;

/// Owns the lifecycle of Confirmed appointments: quota-guarded creation,
/// ownership-checked reschedule and cancellation.
///
/// Every repository call is bounded by the configured timeout. A timeout or a
/// backend failure surfaces as [`BookingError::StorageUnavailable`]. Writes the
/// repository refuses come back as a [`CommitOutcome`] and are mapped by `settle`.
pub struct AppointmentLedger<R> {
    repo: Arc<R>,
    quota: u32,
    reschedule_quota: RescheduleQuota,
    timeout: Duration,
}

impl<R: Repository> AppointmentLedger<R> {
    pub fn new(repo: Arc<R>, config: &Config) -> Self {
        Self {
            repo,
            quota: config.quota,
            reschedule_quota: config.reschedule_quota,
            timeout: config.repository_timeout,
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }

    pub(crate) async fn call<T>(
        &self,
        call: &'static str,
        fut: impl Future<Output = Result<T, RepositoryError>>,
    ) -> Result<T, BookingError> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, fut).await;
        metrics::histogram!(observability::REPOSITORY_CALL_DURATION_SECONDS, "call" => call)
            .record(start.elapsed().as_secs_f64());

        let err = match result {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(RepositoryError::Unavailable(msg))) => msg,
            Err(_) => format!("{call} timed out after {}ms", self.timeout.as_millis()),
        };
        metrics::counter!(observability::REPOSITORY_FAILURES_TOTAL, "call" => call).increment(1);
        warn!(call, "repository call failed: {err}");
        Err(BookingError::StorageUnavailable(err))
    }

    /// Map a conditional write's outcome onto the error taxonomy.
    pub(crate) fn settle(&self, outcome: CommitOutcome) -> Result<(), BookingError> {
        match outcome {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::QuotaExceeded { current } => {
                debug!(current, quota = self.quota, "quota reached by a concurrent booking");
                Err(BookingError::QuotaExceeded { quota: self.quota })
            }
            CommitOutcome::ProviderMissing(id) => Err(BookingError::provider_not_found(id)),
            CommitOutcome::AppointmentMissing(id) => Err(BookingError::appointment_not_found(id)),
            CommitOutcome::ProviderInUse(id) => Err(BookingError::ProviderInUse(id)),
            CommitOutcome::NameTaken(name) => Err(BookingError::NameTaken(name)),
        }
    }

    pub async fn provider(&self, id: Ulid) -> Result<Provider, BookingError> {
        self.call("find_provider", self.repo.find_provider(id))
            .await?
            .ok_or_else(|| BookingError::provider_not_found(id))
    }

    pub async fn get(&self, id: Ulid) -> Result<Appointment, BookingError> {
        self.call("find_appointment", self.repo.find_appointment(id))
            .await?
            .ok_or_else(|| BookingError::appointment_not_found(id))
    }

    /// Record a new Confirmed appointment on behalf of `actor`.
    ///
    /// The eligibility decision is made on a read of the client's load, then the
    /// insert re-checks the quota and the provider atomically, so concurrent
    /// proposals from one client can never push the count past the quota and a
    /// concurrently deleted provider is never booked.
    pub async fn create(&self, actor: &Actor, appointment: Appointment) -> Result<Ulid, BookingError> {
        let provider = self.provider(appointment.provider_id).await?;
        let load = self
            .call("count_confirmed", self.repo.count_confirmed(appointment.client_id))
            .await?;

        let decision = evaluate(actor, &provider, appointment.scheduled_at, load, self.quota);
        debug!(
            client = %appointment.client_id,
            provider = %provider.id,
            load,
            decision = decision.label(),
            "eligibility evaluated"
        );
        decision.into_result(provider.id, appointment.scheduled_at, self.quota)?;

        let id = appointment.id;
        let limit = (!actor.is_privileged()).then_some(self.quota);
        let outcome = self
            .call("insert_appointment", self.repo.insert_appointment(appointment, limit))
            .await?;
        self.settle(outcome)?;
        Ok(id)
    }

    pub async fn list_for(&self, actor: &Actor) -> Result<Vec<Appointment>, BookingError> {
        let filter = AppointmentFilter::visible_to(actor);
        self.call("list_appointments", self.repo.list_appointments(&filter))
            .await
    }

    pub async fn list_for_provider(
        &self,
        actor: &Actor,
        provider_id: Ulid,
    ) -> Result<Vec<Appointment>, BookingError> {
        let filter = AppointmentFilter::visible_to(actor).with_provider(provider_id);
        self.call("list_appointments", self.repo.list_appointments(&filter))
            .await
    }

    /// Apply `change` to an appointment the actor owns (or any, if privileged).
    ///
    /// Ownership is checked before anything about the request itself, so a
    /// non-owner learns nothing beyond the appointment's existence. The new
    /// slot must pass the same eligibility check as a fresh booking.
    pub async fn update(
        &self,
        id: Ulid,
        actor: &Actor,
        change: &AppointmentUpdate,
    ) -> Result<Appointment, BookingError> {
        let mut appointment = self.get(id).await?;
        if !actor.may_access(&appointment) {
            return Err(BookingError::Forbidden {
                actor: actor.id,
                action: "modify this appointment",
            });
        }
        if change.is_empty() {
            return Ok(appointment);
        }

        let provider_id = change.provider_id.unwrap_or(appointment.provider_id);
        let scheduled_at = change.scheduled_at.unwrap_or(appointment.scheduled_at);
        let provider = self.provider(provider_id).await?;

        let decision = match self.reschedule_quota {
            RescheduleQuota::Skip if is_open(&provider.availability, scheduled_at) => {
                Decision::Accepted
            }
            RescheduleQuota::Skip => Decision::RejectedNotAvailable,
            policy => {
                let held = self
                    .call("count_confirmed", self.repo.count_confirmed(appointment.client_id))
                    .await?;
                // The appointment being moved already counts toward its owner's load.
                let load = match policy {
                    RescheduleQuota::ExcludeSelf => held.saturating_sub(1),
                    _ => held,
                };
                evaluate(actor, &provider, scheduled_at, load, self.quota)
            }
        };
        debug!(
            appointment = %id,
            provider = %provider.id,
            decision = decision.label(),
            "reschedule evaluated"
        );
        decision.into_result(provider.id, scheduled_at, self.quota)?;

        appointment.provider_id = provider.id;
        appointment.scheduled_at = scheduled_at;
        let outcome = self
            .call("replace_appointment", self.repo.replace_appointment(appointment.clone()))
            .await?;
        self.settle(outcome)?;
        Ok(appointment)
    }

    /// Remove a Confirmed appointment. A second cancel of the same id is `NotFound`.
    pub async fn cancel(&self, id: Ulid, actor: &Actor) -> Result<(), BookingError> {
        let appointment = self.get(id).await?;
        if !actor.may_access(&appointment) {
            return Err(BookingError::Forbidden {
                actor: actor.id,
                action: "cancel this appointment",
            });
        }
        let outcome = self
            .call("delete_appointment", self.repo.delete_appointment(id))
            .await?;
        self.settle(outcome)
    }
}
