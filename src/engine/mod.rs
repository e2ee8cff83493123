mod conflict;
mod error;
mod mutations;
mod queries;
mod search;
#[cfg(test)]
mod tests;

pub use conflict::{is_available, overlaps_or_equals, parse_day, parse_stay};
pub use error::EngineError;
pub use search::{paginate, truncate_photos, RoomFilter};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

use crate::model::*;
use crate::payment::PaymentGateway;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RoomSlot>;

/// A room plus its tombstone flag. `deleted` is set under the write lock so
/// a commit that raced with the deletion sees it before applying.
#[derive(Debug)]
pub struct RoomEntry {
    pub room: RoomState,
    pub deleted: bool,
}

/// One room's locks. `state` is held only for short reads and writes.
/// `commit` serializes reservation commits on the room across re-check,
/// payment and persist, so readers never wait on the gateway.
#[derive(Debug)]
pub struct RoomSlot {
    pub state: RwLock<RoomEntry>,
    pub commit: Mutex<()>,
}

impl RoomSlot {
    pub fn new(room: RoomState) -> Self {
        Self {
            state: RwLock::new(RoomEntry { room, deleted: false }),
            commit: Mutex::new(()),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<PendingAppend> = Vec::new();
        let mut deferred = None;
        match cmd {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => deferred = Some(other),
        }
        while deferred.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => deferred = Some(other),
                Err(_) => break,
            }
        }
        if !batch.is_empty() {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
            let flush_start = std::time::Instant::now();
            let result = flush_batch(&mut wal, &batch);
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            respond_batch(batch, &result);
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

/// All or nothing: a failed batch is cut off the log and every caller in it
/// is told it failed.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.commit_batch(batch.iter().map(|(event, _)| event))
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.commit_batch([&event]);
            let _ = response.send(result);
        }
    }
}

/// The inventory store and booking engine.
///
/// Resorts are immutable once created. Each room has its own `RoomSlot`;
/// commits on the same room are serialized by the slot's commit lock, and
/// commits on different rooms never contend.
pub struct Engine {
    pub(super) resorts: DashMap<String, ResortState>,
    pub(super) rooms: DashMap<RoomKey, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) gateway: Arc<dyn PaymentGateway>,
    pub(super) payment_timeout: Duration,
    /// Serializes catalogue changes (resort/room create/delete) and compaction.
    pub(super) catalogue: Mutex<()>,
}

/// Apply a room-scoped event. Caller holds the room's write lock.
fn apply_to_room(rs: &mut RoomState, event: &Event) {
    match event {
        Event::PhotoAdded { photo, .. } => rs.insert_photo(photo.clone()),
        Event::ReservationCommitted { reservation, .. } => {
            rs.insert_reservation(reservation.clone())
        }
        // Catalogue events are applied at the map level.
        Event::ResortCreated { .. } | Event::RoomCreated { .. } | Event::RoomDeleted { .. } => {}
    }
}

fn event_room_key(event: &Event) -> Option<&RoomKey> {
    match event {
        Event::PhotoAdded { key, .. } | Event::ReservationCommitted { key, .. } => Some(key),
        Event::RoomDeleted { key } => Some(key),
        Event::RoomCreated { spec } => Some(&spec.key),
        Event::ResortCreated { .. } => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        gateway: Arc<dyn PaymentGateway>,
        payment_timeout: Duration,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resorts: DashMap::new(),
            rooms: DashMap::new(),
            wal_tx,
            gateway,
            payment_timeout,
            catalogue: Mutex::new(()),
        };

        // Sole owner of every lock during replay, so try_write cannot fail.
        for event in &events {
            match event {
                Event::ResortCreated { name, owner, address } => {
                    engine.resorts.insert(
                        name.clone(),
                        ResortState {
                            name: name.clone(),
                            owner: owner.clone(),
                            address: address.clone(),
                        },
                    );
                }
                Event::RoomCreated { spec } => {
                    let Some(resort) = engine.resorts.get(&spec.key.resort) else {
                        warn!("replay: room {} references unknown resort, skipped", spec.key);
                        continue;
                    };
                    let room = RoomState::new(spec.clone(), resort.address.clone());
                    drop(resort);
                    engine.rooms.insert(spec.key.clone(), Arc::new(RoomSlot::new(room)));
                }
                Event::RoomDeleted { key } => {
                    engine.rooms.remove(key);
                }
                other => {
                    let Some(key) = event_room_key(other) else { continue };
                    let Some(shared) = engine.get_room(key) else { continue };
                    if let Ok(mut guard) = shared.state.try_write() {
                        apply_to_room(&mut guard.room, other);
                    }
                }
            }
        }

        info!(
            "engine: replayed {} events ({} resorts, {} rooms)",
            events.len(),
            engine.resorts.len(),
            engine.rooms.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_room(&self, key: &RoomKey) -> Option<SharedRoomState> {
        self.rooms.get(key).map(|e| e.value().clone())
    }

    /// WAL-append then apply. Caller holds the room's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event);
        Ok(())
    }

    /// Resolve a room by resort name and number, distinguishing a missing
    /// resort from a missing room.
    pub(super) fn resolve_room(
        &self,
        resort: &str,
        number: RoomNumber,
    ) -> Result<(RoomKey, SharedRoomState), EngineError> {
        if !self.resorts.contains_key(resort) {
            return Err(EngineError::ResortNotFound(resort.to_string()));
        }
        let key = RoomKey::new(resort, number);
        let room = self.get_room(&key).ok_or(EngineError::RoomNotFound(number))?;
        Ok((key, room))
    }
}
