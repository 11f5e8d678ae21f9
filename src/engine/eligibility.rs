use ulid::Ulid;

use crate::model::*;

use super::availability::is_open;
use super::BookingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    RejectedNotAvailable,
    RejectedQuotaExceeded,
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Accepted => "accepted",
            Decision::RejectedNotAvailable => "not_available",
            Decision::RejectedQuotaExceeded => "quota_exceeded",
        }
    }

    /// Map a rejection onto the error taxonomy.
    pub fn into_result(
        self,
        provider_id: Ulid,
        requested_at: Timestamp,
        quota: u32,
    ) -> Result<(), BookingError> {
        match self {
            Decision::Accepted => Ok(()),
            Decision::RejectedNotAvailable => Err(BookingError::NotAvailable {
                provider_id,
                requested_at,
            }),
            Decision::RejectedQuotaExceeded => Err(BookingError::QuotaExceeded { quota }),
        }
    }
}

/// Decide whether `actor` may hold an appointment with `provider` at `requested_at`.
///
/// Availability is checked first, so a closed slot is reported even when the
/// actor's quota is already exhausted. `current_load` is the number of Confirmed
/// appointments counted against the quota; privileged actors ignore it.
pub fn evaluate(
    actor: &Actor,
    provider: &Provider,
    requested_at: Timestamp,
    current_load: u32,
    quota: u32,
) -> Decision {
    if !is_open(&provider.availability, requested_at) {
        return Decision::RejectedNotAvailable;
    }
    if !actor.is_privileged() && current_load >= quota {
        return Decision::RejectedQuotaExceeded;
    }
    Decision::Accepted
}
