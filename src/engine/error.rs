use crate::model::{RoomKey, RoomNumber};

#[derive(Debug)]
pub enum EngineError {
    /// A date string does not parse as `dd-MM-yyyy`.
    IncorrectFormat(String),
    /// Start/end ordering or the future-start rule is violated.
    IncorrectRange,
    ResortNotFound(String),
    RoomNotFound(RoomNumber),
    /// The requested stay conflicts with an existing reservation.
    UnavailableTimePeriod,
    /// The search filters matched no room at all.
    NoMatchingRooms,
    /// The gateway declined, errored or timed out. Nothing was charged.
    PaymentFailed(String),
    Unauthenticated,
    ResortAlreadyExists(String),
    RoomAlreadyExists(RoomKey),
    HasActiveReservations(RoomKey),
    InvalidPagination(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients; one per kind.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::IncorrectFormat(_) => "22007",
            EngineError::IncorrectRange => "22008",
            EngineError::ResortNotFound(_) | EngineError::RoomNotFound(_) => "P0002",
            EngineError::UnavailableTimePeriod => "23P01",
            EngineError::NoMatchingRooms => "02000",
            EngineError::PaymentFailed(_) => "P0004",
            EngineError::Unauthenticated => "28000",
            EngineError::ResortAlreadyExists(_) | EngineError::RoomAlreadyExists(_) => "23505",
            EngineError::HasActiveReservations(_) => "23503",
            EngineError::InvalidPagination(_) => "22023",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::IncorrectFormat(_) => "incorrect_format",
            EngineError::IncorrectRange => "incorrect_range",
            EngineError::ResortNotFound(_) | EngineError::RoomNotFound(_) => "not_found",
            EngineError::UnavailableTimePeriod => "unavailable_time_period",
            EngineError::NoMatchingRooms => "no_matching_rooms",
            EngineError::PaymentFailed(_) => "payment_failed",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::ResortAlreadyExists(_) | EngineError::RoomAlreadyExists(_) => {
                "already_exists"
            }
            EngineError::HasActiveReservations(_) => "has_active_reservations",
            EngineError::InvalidPagination(_) => "invalid_pagination",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::IncorrectFormat(value) => {
                write!(f, "incorrect date format: {value:?} (expected dd-MM-yyyy)")
            }
            EngineError::IncorrectRange => write!(f, "incorrect date range"),
            EngineError::ResortNotFound(name) => write!(f, "resort not found: {name}"),
            EngineError::RoomNotFound(number) => write!(f, "room with number {number} not found"),
            EngineError::UnavailableTimePeriod => write!(f, "passed time period is unavailable"),
            EngineError::NoMatchingRooms => write!(f, "no rooms match the search criteria"),
            EngineError::PaymentFailed(reason) => write!(f, "payment failed: {reason}"),
            EngineError::Unauthenticated => write!(f, "no authenticated user"),
            EngineError::ResortAlreadyExists(name) => {
                write!(f, "resort name already taken: {name}")
            }
            EngineError::RoomAlreadyExists(key) => {
                write!(f, "room number {} in resort {} is already taken", key.number, key.resort)
            }
            EngineError::HasActiveReservations(key) => {
                write!(f, "cannot delete room {key}: it has unrealized reservations")
            }
            EngineError::InvalidPagination(msg) => write!(f, "invalid pagination: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
