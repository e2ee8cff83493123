use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn today() -> Day {
    chrono::Local::now().date_naive()
}

/// Parse a caller-supplied `dd-MM-yyyy` date. Anything else, including
/// unpadded fields or impossible days, is a format error.
pub fn parse_day(raw: &str) -> Result<Day, EngineError> {
    // chrono tolerates spaces inside numeric fields, so pin the shape first.
    let bytes = raw.as_bytes();
    let shaped = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            2 | 5 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shaped {
        return Err(EngineError::IncorrectFormat(raw.to_string()));
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| EngineError::IncorrectFormat(raw.to_string()))
}

/// Parse both endpoints, then require `start < end`.
pub fn parse_stay(start: &str, end: &str) -> Result<Stay, EngineError> {
    let start = parse_day(start)?;
    let end = parse_day(end)?;
    if start >= end {
        return Err(EngineError::IncorrectRange);
    }
    Ok(Stay::new(start, end))
}

/// Reservation ranges are half-open, so a stay ending on the day another
/// starts does not collide. An identical range always collides.
pub fn overlaps_or_equals(a_start: Day, a_end: Day, b_start: Day, b_end: Day) -> bool {
    (a_start < b_end && b_start < a_end) || (a_start == b_start && a_end == b_end)
}

pub fn is_available(room: &RoomState, stay: &Stay) -> bool {
    !room
        .reservations
        .iter()
        .any(|r| overlaps_or_equals(r.stay.start, r.stay.end, stay.start, stay.end))
}

pub(crate) fn check_no_conflict(room: &RoomState, stay: &Stay) -> Result<(), EngineError> {
    if is_available(room, stay) {
        Ok(())
    } else {
        Err(EngineError::UnavailableTimePeriod)
    }
}

/// Bookings must start strictly after today and stay within the night cap.
pub(crate) fn validate_commit_stay(stay: &Stay, today: Day) -> Result<(), EngineError> {
    if stay.start <= today {
        return Err(EngineError::IncorrectRange);
    }
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(())
}

pub(crate) fn charge_amount(room: &RoomState, stay: &Stay) -> Result<Minor, EngineError> {
    room.price
        .checked_mul(stay.nights())
        .ok_or(EngineError::LimitExceeded("charge amount overflows"))
}
