use chrono::{Datelike, Timelike};

use crate::limits::*;
use crate::model::*;

// ── Weekly calendar ───────────────────────────────────────────────

/// Whether `at` lands inside any window. Weekday and hour are read off the naive
/// wall-clock value; both window bounds are inclusive, so `end_hour:59` is still open.
pub fn is_open(windows: &[AvailabilityWindow], at: Timestamp) -> bool {
    let weekday = at.weekday().num_days_from_sunday() as u8;
    let hour = at.hour() as u8;
    windows.iter().any(|w| w.covers(weekday, hour))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("at least one availability window is required")]
    Empty,
    #[error("{count} availability windows exceeds the limit of {max}")]
    TooMany { count: usize, max: usize },
    #[error("weekday {0} is outside 0..=6")]
    WeekdayOutOfRange(u8),
    #[error("hour {0} is outside 0..=23")]
    HourOutOfRange(u8),
    #[error("window on weekday {weekday} starts at {start_hour} after it ends at {end_hour}")]
    Inverted {
        weekday: u8,
        start_hour: u8,
        end_hour: u8,
    },
}

/// Reject a window set before it is committed to a provider.
pub fn validate_availability_set(windows: &[AvailabilityWindow]) -> Result<(), WindowError> {
    if windows.is_empty() {
        return Err(WindowError::Empty);
    }
    if windows.len() > MAX_WINDOWS_PER_PROVIDER {
        return Err(WindowError::TooMany {
            count: windows.len(),
            max: MAX_WINDOWS_PER_PROVIDER,
        });
    }
    for w in windows {
        if w.weekday > MAX_WEEKDAY {
            return Err(WindowError::WeekdayOutOfRange(w.weekday));
        }
        if let Some(&hour) = [w.start_hour, w.end_hour].iter().find(|h| **h > MAX_HOUR) {
            return Err(WindowError::HourOutOfRange(hour));
        }
        if w.start_hour > w.end_hour {
            return Err(WindowError::Inverted {
                weekday: w.weekday,
                start_hour: w.start_hour,
                end_hour: w.end_hour,
            });
        }
    }
    Ok(())
}
