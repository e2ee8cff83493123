use tracing::debug;

use crate::model::*;

use super::conflict::{is_available, parse_stay};
use super::search::{paginate, truncate_photos, validate_paging, RoomFilter};
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    pub fn find_resort_by_name(&self, name: &str) -> Option<ResortState> {
        self.resorts.get(name).map(|r| r.value().clone())
    }

    /// Every room in inventory order: by resort name, then room number.
    pub fn list_rooms(&self) -> Vec<(RoomKey, SharedRoomState)> {
        let mut rooms: Vec<(RoomKey, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms
    }

    /// Whether `[start, end)` is free in the given room. Past ranges are
    /// allowed; only the format and `start < end` are checked.
    pub async fn check_availability(
        &self,
        resort: &str,
        number: RoomNumber,
        start: &str,
        end: &str,
    ) -> Result<bool, EngineError> {
        let stay = parse_stay(start, end)?;
        let (_, room) = self.resolve_room(resort, number)?;
        let guard = room.state.read().await;
        if guard.deleted {
            return Err(EngineError::RoomNotFound(number));
        }
        Ok(is_available(&guard.room, &stay))
    }

    /// Run the filter pipeline over the inventory, one room lock at a time.
    async fn scan<T>(&self, filter: &RoomFilter, mut project: impl FnMut(&RoomState) -> T) -> Vec<T> {
        let mut hits = Vec::new();
        for (_, room) in self.list_rooms() {
            let guard = room.state.read().await;
            if !guard.deleted && filter.matches(&guard.room) {
                hits.push(project(&guard.room));
            }
        }
        hits
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> Result<SearchPage, EngineError> {
        let filter = RoomFilter::from_criteria(criteria)?;
        validate_paging(criteria.page, criteria.page_size)?;

        let matched = self.scan(&filter, RoomState::summary).await;
        if matched.is_empty() {
            return Err(EngineError::NoMatchingRooms);
        }
        let total = matched.len();
        let mut rooms = paginate(matched, criteria.page, criteria.page_size)?;
        truncate_photos(&mut rooms, criteria.photos);
        debug!(
            "search location={} residents={} stay={}: {total} matched, {} returned",
            filter.location,
            filter.residents,
            filter.stay,
            rooms.len()
        );
        Ok(SearchPage { rooms, total })
    }

    /// Size of the filtered set before paging. Zero is a valid answer.
    pub async fn count(&self, criteria: &SearchCriteria) -> Result<usize, EngineError> {
        let filter = RoomFilter::from_criteria(criteria)?;
        Ok(self.scan(&filter, |_| ()).await.len())
    }

    pub async fn get_reservations(
        &self,
        resort: &str,
        number: RoomNumber,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let (_, room) = self.resolve_room(resort, number)?;
        let guard = room.state.read().await;
        if guard.deleted {
            return Err(EngineError::RoomNotFound(number));
        }
        Ok(guard
            .room
            .reservations
            .iter()
            .map(|r| guard.room.reservation_info(r))
            .collect())
    }
}
