// Hard caps on inventory size and request shape.

pub const MAX_RESORTS: usize = 10_000;
pub const MAX_ROOMS: usize = 100_000;
pub const MAX_RESERVATIONS_PER_ROOM: usize = 50_000;
pub const MAX_PHOTOS_PER_ROOM: usize = 64;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_TOKEN_LEN: usize = 256;
pub const MAX_CURRENCY_LEN: usize = 3;

/// Longest stay a single reservation may cover.
pub const MAX_STAY_NIGHTS: i64 = 365;

pub const MAX_PAGE_SIZE: u32 = 1_000;

/// Prices enter the system as major units and are stored as minor units.
pub const CURRENCY_MULTIPLIER: i64 = 100;
