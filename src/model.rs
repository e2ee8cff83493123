use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::CURRENCY_MULTIPLIER;

/// A calendar date. No time-of-day component.
pub type Day = NaiveDate;

pub type RoomNumber = u32;

/// Money in the currency's minor unit (grosze, cents).
pub type Minor = i64;

/// The only date format exchanged with callers: `dd-MM-yyyy`.
pub const DATE_FORMAT: &str = "%d-%m-%Y";

pub fn format_day(day: Day) -> String {
    day.format(DATE_FORMAT).to_string()
}

/// Render minor units as a major-unit decimal, e.g. `12050` → `"120.50"`.
pub fn format_price(minor: Minor) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    let mult = CURRENCY_MULTIPLIER.unsigned_abs();
    format!("{sign}{}.{:02}", abs / mult, abs % mult)
}

/// Half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub start: Day,
    pub end: Day,
}

impl Stay {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    /// Whole nights between check-in and check-out.
    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for Stay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_day(self.start), format_day(self.end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub country: String,
    pub city: String,
    pub street: String,
    pub street_number: String,
}

impl Address {
    /// Case-insensitive match against either the country or the city.
    pub fn matches_location(&self, location: &str) -> bool {
        self.country.to_lowercase() == location.to_lowercase()
            || self.city.to_lowercase() == location.to_lowercase()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoomAmenity {
    AirConditioning,
    Kitchenette,
    Kitchen,
    Balcony,
    Tv,
    Washer,
    Netflix,
    PrivateBathroom,
    Fridge,
    Microwave,
    Iron,
}

impl RoomAmenity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomAmenity::AirConditioning => "AIR_CONDITIONING",
            RoomAmenity::Kitchenette => "KITCHENETTE",
            RoomAmenity::Kitchen => "KITCHEN",
            RoomAmenity::Balcony => "BALCONY",
            RoomAmenity::Tv => "TV",
            RoomAmenity::Washer => "WASHER",
            RoomAmenity::Netflix => "NETFLIX",
            RoomAmenity::PrivateBathroom => "PRIVATE_BATHROOM",
            RoomAmenity::Fridge => "FRIDGE",
            RoomAmenity::Microwave => "MICROWAVE",
            RoomAmenity::Iron => "IRON",
        }
    }
}

impl FromStr for RoomAmenity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AIR_CONDITIONING" => Ok(RoomAmenity::AirConditioning),
            "KITCHENETTE" => Ok(RoomAmenity::Kitchenette),
            "KITCHEN" => Ok(RoomAmenity::Kitchen),
            "BALCONY" => Ok(RoomAmenity::Balcony),
            "TV" => Ok(RoomAmenity::Tv),
            "WASHER" => Ok(RoomAmenity::Washer),
            "NETFLIX" => Ok(RoomAmenity::Netflix),
            "PRIVATE_BATHROOM" => Ok(RoomAmenity::PrivateBathroom),
            "FRIDGE" => Ok(RoomAmenity::Fridge),
            "MICROWAVE" => Ok(RoomAmenity::Microwave),
            "IRON" => Ok(RoomAmenity::Iron),
            other => Err(format!("unknown room amenity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beds {
    pub single: u32,
    pub double: u32,
    pub king_size: u32,
}

/// Room identity: unique room number within a uniquely named resort.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub resort: String,
    pub number: RoomNumber,
}

impl RoomKey {
    pub fn new(resort: impl Into<String>, number: RoomNumber) -> Self {
        Self {
            resort: resort.into(),
            number,
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resort, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub position: u32,
    pub url: String,
}

/// A committed booking of a room. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub user: String,
    pub stay: Stay,
    pub amount: Minor,
    pub receipt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResortState {
    pub name: String,
    pub owner: String,
    pub address: Address,
}

/// Fields a room is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub key: RoomKey,
    pub price: Minor,
    pub currency: String,
    pub capacity: u32,
    pub beds: Beds,
    pub amenities: Vec<RoomAmenity>,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub key: RoomKey,
    /// Inherited from the owning resort.
    pub address: Address,
    pub price: Minor,
    pub currency: String,
    /// Max occupants.
    pub capacity: u32,
    pub beds: Beds,
    pub amenities: Vec<RoomAmenity>,
    /// Sorted by `position`.
    pub photos: Vec<Photo>,
    /// Sorted by `stay.start`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(spec: RoomSpec, address: Address) -> Self {
        Self {
            key: spec.key,
            address,
            price: spec.price,
            currency: spec.currency,
            capacity: spec.capacity,
            beds: spec.beds,
            amenities: spec.amenities,
            photos: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by stay start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.stay.start, |r| r.stay.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Insert photo maintaining sort order by position. A photo at an
    /// already used position replaces the old one.
    pub fn insert_photo(&mut self, photo: Photo) {
        match self
            .photos
            .binary_search_by_key(&photo.position, |p| p.position)
        {
            Ok(pos) => self.photos[pos] = photo,
            Err(pos) => self.photos.insert(pos, photo),
        }
    }

    /// Reservations that are not over yet: end date today or later.
    pub fn unrealized(&self, today: Day) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(move |r| r.stay.end >= today)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            resort: self.key.resort.clone(),
            number: self.key.number,
            country: self.address.country.clone(),
            city: self.address.city.clone(),
            street: self.address.street.clone(),
            street_number: self.address.street_number.clone(),
            price: self.price,
            currency: self.currency.clone(),
            capacity: self.capacity,
            beds: self.beds,
            amenities: self.amenities.clone(),
            photos: self.photos.clone(),
        }
    }

    pub fn reservation_info(&self, reservation: &Reservation) -> ReservationInfo {
        ReservationInfo {
            id: reservation.id,
            resort: self.key.resort.clone(),
            room: self.key.number,
            user: reservation.user.clone(),
            start: reservation.stay.start,
            end: reservation.stay.end,
            amount: reservation.amount,
            currency: self.currency.clone(),
        }
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResortCreated {
        name: String,
        owner: String,
        address: Address,
    },
    RoomCreated {
        spec: RoomSpec,
    },
    RoomDeleted {
        key: RoomKey,
    },
    PhotoAdded {
        key: RoomKey,
        photo: Photo,
    },
    ReservationCommitted {
        key: RoomKey,
        reservation: Reservation,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// Search filters as received from a caller. Dates are unparsed so that
/// format errors surface from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub location: String,
    pub residents: u32,
    pub start: String,
    pub end: String,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub photos: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub resort: String,
    pub room: RoomNumber,
    pub start: String,
    pub end: String,
    pub payment_token: String,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub resort: String,
    pub number: RoomNumber,
    pub country: String,
    pub city: String,
    pub street: String,
    pub street_number: String,
    pub price: Minor,
    pub currency: String,
    pub capacity: u32,
    pub beds: Beds,
    pub amenities: Vec<RoomAmenity>,
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub rooms: Vec<RoomSummary>,
    /// Size of the filtered set before pagination.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resort: String,
    pub room: RoomNumber,
    pub user: String,
    pub start: Day,
    pub end: Day,
    pub amount: Minor,
    pub currency: String,
}
