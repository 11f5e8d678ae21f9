use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use ulid::Ulid;

/// Wall-clock timestamp exactly as the caller wrote it. No time zone is attached.
pub type Timestamp = NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Administrator,
}

/// An already-authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn client(id: Ulid) -> Self {
        Self { id, role: Role::Client }
    }

    pub fn administrator(id: Ulid) -> Self {
        Self {
            id,
            role: Role::Administrator,
        }
    }

    /// The one privilege predicate. Quota exemption and ownership bypass both go through here.
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Administrator)
    }

    pub fn may_access(&self, appointment: &Appointment) -> bool {
        self.is_privileged() || appointment.client_id == self.id
    }
}

/// Recurring weekly open interval. Weekday 0 is Sunday; both hours are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub weekday: u8,
    pub start_hour: u8,
    pub end_hour: u8,
}

impl AvailabilityWindow {
    pub fn new(weekday: u8, start_hour: u8, end_hour: u8) -> Self {
        Self {
            weekday,
            start_hour,
            end_hour,
        }
    }

    pub fn covers(&self, weekday: u8, hour: u8) -> bool {
        self.weekday == weekday && self.start_hour <= hour && hour <= self.end_hour
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    pub name: String,
    pub years_of_experience: u32,
    pub specialty: String,
    pub availability: Vec<AvailabilityWindow>,
}

/// Provider fields supplied on create/update. Validated before it becomes a `Provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDraft {
    pub name: String,
    pub years_of_experience: u32,
    pub specialty: String,
    pub availability: Vec<AvailabilityWindow>,
}

impl ProviderDraft {
    pub fn into_provider(self, id: Ulid) -> Provider {
        Provider {
            id,
            name: self.name.trim().to_string(),
            years_of_experience: self.years_of_experience,
            specialty: self.specialty.trim().to_string(),
            availability: self.availability,
        }
    }
}

/// A Confirmed appointment. Cancelled appointments are removed, not flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub scheduled_at: Timestamp,
    pub created_at: Timestamp,
}

/// Explicit booking body. `client_id` is never part of it; it comes from the actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub provider_id: Ulid,
    #[serde(deserialize_with = "deserialize_wall_clock")]
    pub requested_at: Timestamp,
}

/// Reschedule body. Either field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentUpdate {
    #[serde(default, deserialize_with = "deserialize_opt_wall_clock")]
    pub scheduled_at: Option<Timestamp>,
    #[serde(default)]
    pub provider_id: Option<Ulid>,
}

impl AppointmentUpdate {
    pub fn reschedule(scheduled_at: Timestamp) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            provider_id: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scheduled_at.is_none() && self.provider_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub client_id: Option<Ulid>,
    pub provider_id: Option<Ulid>,
}

impl AppointmentFilter {
    /// What `actor` may see: everything for administrators, own records otherwise.
    pub fn visible_to(actor: &Actor) -> Self {
        Self {
            client_id: (!actor.is_privileged()).then_some(actor.id),
            provider_id: None,
        }
    }

    pub fn with_provider(mut self, provider_id: Ulid) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn matches(&self, appointment: &Appointment) -> bool {
        self.client_id.is_none_or(|c| c == appointment.client_id)
            && self.provider_id.is_none_or(|p| p == appointment.provider_id)
    }
}

/// Parse a caller-supplied timestamp. RFC 3339 offsets are dropped, keeping the written wall-clock time.
pub fn parse_wall_clock(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn deserialize_wall_clock<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
    let raw = String::deserialize(d)?;
    parse_wall_clock(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn deserialize_opt_wall_clock<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<Timestamp>, D::Error> {
    match Option::<String>::deserialize(d)? {
        None => Ok(None),
        Some(raw) => parse_wall_clock(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
    }
}

/// One committed change to the booking store. Flat variants, logged as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderSaved {
        id: Ulid,
        name: String,
        years_of_experience: u32,
        specialty: String,
        availability: Vec<AvailabilityWindow>,
    },
    ProviderDeleted {
        id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        client_id: Ulid,
        provider_id: Ulid,
        scheduled_at: Timestamp,
        created_at: Timestamp,
    },
    AppointmentRescheduled {
        id: Ulid,
        provider_id: Ulid,
        scheduled_at: Timestamp,
    },
    AppointmentCancelled {
        id: Ulid,
    },
}

impl Event {
    pub fn provider_saved(provider: &Provider) -> Self {
        Event::ProviderSaved {
            id: provider.id,
            name: provider.name.clone(),
            years_of_experience: provider.years_of_experience,
            specialty: provider.specialty.clone(),
            availability: provider.availability.clone(),
        }
    }

    pub fn appointment_booked(appointment: &Appointment) -> Self {
        Event::AppointmentBooked {
            id: appointment.id,
            client_id: appointment.client_id,
            provider_id: appointment.provider_id,
            scheduled_at: appointment.scheduled_at,
            created_at: appointment.created_at,
        }
    }
}
