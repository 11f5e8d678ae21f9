use std::fmt;

use ulid::Ulid;

use crate::model::Timestamp;
use crate::repository::RepositoryError;

use super::availability::WindowError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Provider,
    Appointment,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Provider => f.write_str("provider"),
            Entity::Appointment => f.write_str("appointment"),
        }
    }
}

/// Every way an engine operation can fail. Each variant has a stable [`code`](Self::code).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BookingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: Entity, id: Ulid },
    #[error("provider {provider_id} is not available at {requested_at}")]
    NotAvailable {
        provider_id: Ulid,
        requested_at: Timestamp,
    },
    #[error("booking quota reached: at most {quota} confirmed appointments")]
    QuotaExceeded { quota: u32 },
    #[error("actor {actor} is not permitted to {action}")]
    Forbidden { actor: Ulid, action: &'static str },
    #[error("invalid availability: {0}")]
    InvalidWindow(#[from] WindowError),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("provider name already in use: {0}")]
    NameTaken(String),
    #[error("provider {0} still has confirmed appointments")]
    ProviderInUse(Ulid),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl BookingError {
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::NotFound { .. } => "not_found",
            BookingError::NotAvailable { .. } => "not_available",
            BookingError::QuotaExceeded { .. } => "quota_exceeded",
            BookingError::Forbidden { .. } => "forbidden",
            BookingError::InvalidWindow(_) => "invalid_window",
            BookingError::InvalidRequest(_) => "invalid_request",
            BookingError::NameTaken(_) => "name_taken",
            BookingError::ProviderInUse(_) => "provider_in_use",
            BookingError::StorageUnavailable(_) => "storage_unavailable",
        }
    }

    /// Only storage failures are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BookingError::StorageUnavailable(_))
    }

    pub(crate) fn provider_not_found(id: Ulid) -> Self {
        BookingError::NotFound {
            entity: Entity::Provider,
            id,
        }
    }

    pub(crate) fn appointment_not_found(id: Ulid) -> Self {
        BookingError::NotFound {
            entity: Entity::Appointment,
            id,
        }
    }
}

impl From<RepositoryError> for BookingError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Unavailable(msg) => BookingError::StorageUnavailable(msg),
        }
    }
}
