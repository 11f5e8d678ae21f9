/// Maximum provider name length in characters (after trimming).
pub const MAX_NAME_LEN: usize = 50;

/// Maximum specialty length in characters (after trimming).
pub const MAX_SPECIALTY_LEN: usize = 100;

/// Maximum availability windows per provider.
pub const MAX_WINDOWS_PER_PROVIDER: usize = 64;

/// Weekdays are numbered 0 (Sunday) through 6 (Saturday).
pub const MAX_WEEKDAY: u8 = 6;

pub const MAX_HOUR: u8 = 23;

/// Largest encoded event the booking log will write or replay.
pub const MAX_EVENT_BYTES: usize = 1 << 20;
