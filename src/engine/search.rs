use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

use super::conflict::{is_available, parse_stay};
use super::EngineError;

// ── Filter pipeline ──────────────────────────────────────────────

/// The three search predicates. A room is a hit only if all of them pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFilter {
    pub location: String,
    pub residents: u32,
    pub stay: Stay,
}

impl RoomFilter {
    /// Validate dates and build the filter. Past ranges are allowed here;
    /// only bookings must start in the future.
    pub fn from_criteria(criteria: &SearchCriteria) -> Result<Self, EngineError> {
        let stay = parse_stay(&criteria.start, &criteria.end)?;
        Ok(Self {
            location: criteria.location.clone(),
            residents: criteria.residents,
            stay,
        })
    }

    pub fn matches(&self, room: &RoomState) -> bool {
        room.address.matches_location(&self.location)
            && room.capacity == self.residents
            && is_available(room, &self.stay)
    }
}

// ── Paging ───────────────────────────────────────────────────────

/// Reject zero or oversized paging values. Both are checked whenever given,
/// even if the other one is missing.
pub(crate) fn validate_paging(page: Option<u32>, page_size: Option<u32>) -> Result<(), EngineError> {
    if page == Some(0) {
        return Err(EngineError::InvalidPagination("page must be at least 1"));
    }
    match page_size {
        Some(0) => Err(EngineError::InvalidPagination("page_size must be at least 1")),
        Some(n) if n > MAX_PAGE_SIZE => Err(EngineError::LimitExceeded("page_size too large")),
        _ => Ok(()),
    }
}

/// 1-based slice of `items`. Paging only applies when both values are
/// given; a page past the end is empty, not an error.
pub fn paginate<T>(
    items: Vec<T>,
    page: Option<u32>,
    page_size: Option<u32>,
) -> Result<Vec<T>, EngineError> {
    validate_paging(page, page_size)?;
    let (Some(page), Some(size)) = (page, page_size) else {
        return Ok(items);
    };
    let size = size as usize;
    let skip = (page as usize - 1).saturating_mul(size);
    Ok(items.into_iter().skip(skip).take(size).collect())
}

/// Cut each room's photo list to at most `limit` entries.
pub fn truncate_photos(rooms: &mut [RoomSummary], limit: Option<usize>) {
    let Some(limit) = limit else { return };
    for room in rooms {
        room.photos.truncate(limit.min(room.photos.len()));
    }
}
