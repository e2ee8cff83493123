use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::identity::IdentityProvider;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::payment::{with_deadline, Charge, Receipt};

use super::conflict::{
    charge_amount, check_no_conflict, parse_stay, today, validate_commit_stay,
};
use super::{Engine, EngineError, RoomSlot, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    pub async fn create_resort(
        &self,
        name: String,
        owner: String,
        address: Address,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "resort name too long")?;
        check_len(&owner, MAX_NAME_LEN, "owner too long")?;
        for field in [&address.country, &address.city, &address.street, &address.street_number] {
            check_len(field, MAX_NAME_LEN, "address field too long")?;
        }

        let _catalogue = self.catalogue.lock().await;
        if self.resorts.len() >= MAX_RESORTS {
            return Err(EngineError::LimitExceeded("too many resorts"));
        }
        if self.resorts.contains_key(&name) {
            return Err(EngineError::ResortAlreadyExists(name));
        }

        let event = Event::ResortCreated {
            name: name.clone(),
            owner: owner.clone(),
            address: address.clone(),
        };
        self.wal_append(&event).await?;
        info!("created resort {name}");
        self.resorts.insert(name.clone(), ResortState { name, owner, address });
        Ok(())
    }

    pub async fn create_room(&self, spec: RoomSpec) -> Result<(), EngineError> {
        check_len(&spec.currency, MAX_CURRENCY_LEN, "currency code too long")?;

        let _catalogue = self.catalogue.lock().await;
        let address = self
            .find_resort_by_name(&spec.key.resort)
            .ok_or_else(|| EngineError::ResortNotFound(spec.key.resort.clone()))?
            .address;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&spec.key) {
            return Err(EngineError::RoomAlreadyExists(spec.key));
        }

        let event = Event::RoomCreated { spec: spec.clone() };
        self.wal_append(&event).await?;
        let key = spec.key.clone();
        self.rooms.insert(key, Arc::new(RoomSlot::new(RoomState::new(spec, address))));
        Ok(())
    }

    pub async fn add_photo(
        &self,
        resort: &str,
        number: RoomNumber,
        photo: Photo,
    ) -> Result<(), EngineError> {
        check_len(&photo.url, MAX_URL_LEN, "photo url too long")?;
        let (key, room) = self.resolve_room(resort, number)?;
        let mut guard = room.state.write().await;
        if guard.deleted {
            return Err(EngineError::RoomNotFound(number));
        }
        let replaces = guard.room.photos.iter().any(|p| p.position == photo.position);
        if !replaces && guard.room.photos.len() >= MAX_PHOTOS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many photos on room"));
        }
        let event = Event::PhotoAdded { key, photo };
        self.persist_and_apply(&mut guard.room, &event).await
    }

    /// Remove a room. Refused while any reservation on it ends today or later.
    pub async fn delete_room(&self, resort: &str, number: RoomNumber) -> Result<(), EngineError> {
        let _catalogue = self.catalogue.lock().await;
        let (key, room) = self.resolve_room(resort, number)?;
        let mut guard = room.state.write().await;
        if guard.deleted {
            return Err(EngineError::RoomNotFound(number));
        }
        if guard.room.unrealized(today()).next().is_some() {
            return Err(EngineError::HasActiveReservations(key));
        }

        let event = Event::RoomDeleted { key: key.clone() };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.rooms.remove(&key);
        info!("deleted room {key}");
        Ok(())
    }

    /// Book a room: validate, re-check availability, charge, persist.
    ///
    /// The room's commit lock is held from the availability check until the
    /// reservation is applied, so a competing commit for the same room waits
    /// and then sees this reservation. The state lock is only taken for the
    /// re-check and the apply, so searches never wait on the gateway.
    /// Nothing is charged unless the check passed, and nothing is stored
    /// unless the charge succeeded.
    pub async fn commit_reservation(
        &self,
        request: &ReservationRequest,
        identity: &dyn IdentityProvider,
    ) -> Result<ReservationInfo, EngineError> {
        let result = self.try_commit(request, identity).await;
        match &result {
            Ok(info) => {
                metrics::counter!(observability::RESERVATIONS_COMMITTED_TOTAL).increment(1);
                info!(
                    "reservation {} committed: {}#{} [{}, {}) for {}",
                    info.id,
                    info.resort,
                    info.room,
                    format_day(info.start),
                    format_day(info.end),
                    info.user
                );
            }
            Err(e) => {
                metrics::counter!(
                    observability::RESERVATIONS_REJECTED_TOTAL,
                    "reason" => e.kind()
                )
                .increment(1);
                if let EngineError::WalError(_) = e {
                    error!("reservation for {}#{} failed: {e}", request.resort, request.room);
                } else {
                    warn!("reservation for {}#{} rejected: {e}", request.resort, request.room);
                }
            }
        }
        result
    }

    async fn try_commit(
        &self,
        request: &ReservationRequest,
        identity: &dyn IdentityProvider,
    ) -> Result<ReservationInfo, EngineError> {
        // Validate
        let stay = parse_stay(&request.start, &request.end)?;
        validate_commit_stay(&stay, today())?;
        check_len(&request.payment_token, MAX_TOKEN_LEN, "payment token too long")?;

        // Resolve target and principal before anything is locked or charged.
        let (key, room) = self.resolve_room(&request.resort, request.room)?;
        let user = identity.current_user()?;

        let _commit = room.commit.lock().await;

        // CheckAvailability
        let (amount, currency) = {
            let guard = room.state.read().await;
            if guard.deleted {
                return Err(EngineError::RoomNotFound(request.room));
            }
            if guard.room.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
                return Err(EngineError::LimitExceeded("too many reservations on room"));
            }
            check_no_conflict(&guard.room, &stay)?;
            (charge_amount(&guard.room, &stay)?, guard.room.currency.clone())
        };

        // Authorize payment
        let charge = Charge {
            amount,
            currency,
            token: request.payment_token.clone(),
            description: format!("{key} {stay}"),
        };
        let started = Instant::now();
        let outcome = with_deadline(self.payment_timeout, self.gateway.charge(&charge)).await;
        metrics::histogram!(observability::PAYMENT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        let receipt = outcome.map_err(|e| EngineError::PaymentFailed(e.to_string()))?;

        // Persist
        let reservation = Reservation {
            id: Ulid::new(),
            user: user.name,
            stay,
            amount: charge.amount,
            receipt: receipt.id.clone(),
        };
        let event = Event::ReservationCommitted {
            key,
            reservation: reservation.clone(),
        };
        let mut guard = room.state.write().await;
        // Deleted while the charge was in flight.
        let persisted = if guard.deleted {
            Err(EngineError::RoomNotFound(request.room))
        } else {
            self.persist_and_apply(&mut guard.room, &event).await
        };
        if let Err(e) = persisted {
            drop(guard);
            self.refund_unpersisted(&receipt).await;
            return Err(e);
        }
        Ok(guard.room.reservation_info(&reservation))
    }

    /// One compensating refund for a charge whose reservation was not stored.
    async fn refund_unpersisted(&self, receipt: &Receipt) {
        match with_deadline(self.payment_timeout, self.gateway.refund(receipt)).await {
            Ok(()) => warn!("refunded charge {} after failed persist", receipt.id),
            Err(e) => error!(
                "refund of charge {} ({} minor {}) failed, needs manual reconciliation: {e}",
                receipt.id, receipt.amount, receipt.currency
            ),
        }
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// Holds the catalogue lock and a read lock on every room until the new
    /// log is installed, so no event can land in the old log after the
    /// snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalogue = self.catalogue.lock().await;

        let mut resorts: Vec<ResortState> = self.resorts.iter().map(|r| r.value().clone()).collect();
        resorts.sort_by(|a, b| a.name.cmp(&b.name));
        let mut events: Vec<Event> = resorts
            .into_iter()
            .map(|r| Event::ResortCreated {
                name: r.name,
                owner: r.owner,
                address: r.address,
            })
            .collect();

        let rooms = self.list_rooms();
        let mut guards = Vec::with_capacity(rooms.len());
        for (key, room) in &rooms {
            let guard = room.state.read().await;
            if guard.deleted {
                continue;
            }
            let rs = &guard.room;
            events.push(Event::RoomCreated {
                spec: RoomSpec {
                    key: key.clone(),
                    price: rs.price,
                    currency: rs.currency.clone(),
                    capacity: rs.capacity,
                    beds: rs.beds,
                    amenities: rs.amenities.clone(),
                },
            });
            events.extend(rs.photos.iter().map(|photo| Event::PhotoAdded {
                key: key.clone(),
                photo: photo.clone(),
            }));
            events.extend(rs.reservations.iter().map(|reservation| {
                Event::ReservationCommitted {
                    key: key.clone(),
                    reservation: reservation.clone(),
                }
            }));
            guards.push(guard);
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
