mod conflict;
mod error;
mod mutations;
pub mod policy;
mod queries;
pub mod recurrence;
pub mod slots;
mod sync;
#[cfg(test)]
mod tests;

pub use error::{
    BookingError, CapacityScope, ConflictingBooking, EntityKind, Party, PolicyViolation,
};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tracing::{error, info};
use ulid::Ulid;

use crate::calendar::CalendarSync;
use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedTrainerState = Arc<RwLock<TrainerState>>;
pub type SharedClientLedger = Arc<Mutex<ClientLedger>>;

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
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
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-written batch lingers in the buffer.
    let flushed = wal.flush_sync();
    let result = written.and(flushed);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.compact(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Trainer and client a booking belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingOwner {
    pub trainer_id: Ulid,
    pub client_id: Ulid,
}

/// Reverse lookups from child entities to the trainer that owns them.
#[derive(Default)]
pub(super) struct Index {
    pub bookings: DashMap<Ulid, BookingOwner>,
    pub blocks: DashMap<Ulid, Ulid>,
}

pub struct Engine {
    pub(super) trainers: DashMap<Ulid, SharedTrainerState>,
    pub(super) clients: DashMap<Ulid, SharedClientLedger>,
    pub(super) index: Index,
    /// Writers hold this shared; compaction takes it exclusively so the
    /// snapshot and the log swap see no interleaved appends. Always acquired
    /// before any client or trainer lock.
    pub(super) write_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) calendar: Arc<dyn CalendarSync>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) sync_timeout: Duration,
}

/// Apply an event to a trainer (caller holds the write lock).
/// Returns the booking the event touched, if any.
fn apply_to_trainer(ts: &mut TrainerState, event: &Event, index: &Index) -> Option<Booking> {
    match event {
        Event::AvailabilitySet { availability, .. } => {
            if let Some(slot) = ts.availability.get_mut(availability.day_of_week as usize) {
                *slot = Some(*availability);
            }
            None
        }
        Event::CapacitySet { settings, .. } => {
            ts.capacity = Some(*settings);
            None
        }
        Event::PreferencesSet { preferences, .. } => {
            ts.preferences = Some(*preferences);
            None
        }
        Event::BlockAdded { block } => {
            index.blocks.insert(block.id, block.trainer_id);
            ts.blocks.push(block.clone());
            None
        }
        Event::BlockRemoved { id, .. } => {
            ts.blocks.retain(|b| b.id != *id);
            index.blocks.remove(id);
            None
        }
        Event::BookingCreated { booking } => {
            index.bookings.insert(
                booking.id,
                BookingOwner {
                    trainer_id: booking.trainer_id,
                    client_id: booking.client_id,
                },
            );
            ts.insert_booking(booking.clone());
            Some(booking.clone())
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            let booking = ts.booking_mut(id)?;
            booking.status = *status;
            booking.updated_at = *at;
            Some(booking.clone())
        }
        Event::BookingRescheduled {
            id,
            date,
            start_time,
            end_time,
            at,
            ..
        } => {
            let mut booking = ts.remove_booking(*id)?;
            booking.date = *date;
            booking.start_time = *start_time;
            booking.end_time = *end_time;
            booking.updated_at = *at;
            ts.insert_booking(booking.clone());
            Some(booking)
        }
        Event::BookingSyncRefSet { id, external_ref, .. } => {
            if let Some(booking) = ts.booking_mut(id) {
                booking.external_sync_ref = external_ref.clone();
            }
            None
        }
        // Registrations are handled at the map level.
        Event::TrainerRegistered { .. } | Event::ClientRegistered { .. } => None,
    }
}

/// Mirror a booking's current state into its client's ledger.
fn track_in_ledger(ledger: &mut ClientLedger, booking: &Booking) {
    if booking.is_active() {
        ledger.upsert(ClientBooking {
            booking_id: booking.id,
            trainer_id: booking.trainer_id,
            date: booking.date,
            span: booking.span(),
        });
    } else {
        ledger.remove(booking.id);
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        calendar: Arc<dyn CalendarSync>,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            trainers: DashMap::new(),
            clients: DashMap::new(),
            index: Index::default(),
            write_gate: RwLock::new(()),
            wal_tx,
            calendar,
            clock,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        };
        for event in &events {
            engine.replay_event(event)?;
        }
        metrics::gauge!(observability::TRAINERS_LOADED).set(engine.trainers.len() as f64);
        info!(
            events = events.len(),
            trainers = engine.trainers.len(),
            clients = engine.clients.len(),
            "replayed {}",
            wal_path.display()
        );
        Ok(engine)
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Nothing else holds these locks during replay, so try_* always succeeds.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: state lock unexpectedly held");
        match event {
            Event::TrainerRegistered { id, name } => {
                self.trainers
                    .insert(*id, Arc::new(RwLock::new(TrainerState::new(*id, name.clone()))));
            }
            Event::ClientRegistered { id, name } => {
                self.clients
                    .insert(*id, Arc::new(Mutex::new(ClientLedger::new(*id, name.clone()))));
            }
            other => {
                let Some(ts) = other.trainer_id().and_then(|id| self.trainer(&id)) else {
                    return Ok(());
                };
                let mut guard = ts.try_write().map_err(|_| contended())?;
                let touched = apply_to_trainer(&mut guard, other, &self.index);
                if let Some(booking) = touched
                    && let Some(ledger) = self.client(&booking.client_id)
                {
                    let mut ledger = ledger.try_lock().map_err(|_| contended())?;
                    track_in_ledger(&mut ledger, &booking);
                }
            }
        }
        Ok(())
    }

    pub(super) fn now(&self) -> chrono::NaiveDateTime {
        self.clock.now()
    }

    pub fn trainer(&self, id: &Ulid) -> Option<SharedTrainerState> {
        self.trainers.get(id).map(|e| e.value().clone())
    }

    pub fn client(&self, id: &Ulid) -> Option<SharedClientLedger> {
        self.clients.get(id).map(|e| e.value().clone())
    }

    pub fn booking_owner(&self, booking_id: &Ulid) -> Option<BookingOwner> {
        self.index.bookings.get(booking_id).map(|e| *e.value())
    }

    pub(super) fn require_trainer(&self, id: Ulid) -> Result<SharedTrainerState, BookingError> {
        self.trainer(&id)
            .ok_or_else(|| BookingError::not_found(EntityKind::Trainer, id))
    }

    pub(super) fn require_client(&self, id: Ulid) -> Result<SharedClientLedger, BookingError> {
        self.client(&id)
            .ok_or_else(|| BookingError::not_found(EntityKind::Client, id))
    }

    pub(super) fn require_booking(&self, id: Ulid) -> Result<BookingOwner, BookingError> {
        self.booking_owner(&id)
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, id))
    }

    /// Hand one event to the group-commit writer and wait for its fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    /// WAL-append, then apply to the trainer and (when given) the client ledger.
    /// Nothing is applied if the append fails.
    pub(super) async fn commit(
        &self,
        ts: &mut TrainerState,
        ledger: Option<&mut ClientLedger>,
        event: &Event,
    ) -> Result<Option<Booking>, BookingError> {
        if let Err(e) = self.wal_append(event).await {
            error!(
                trainer_id = ?event.trainer_id(),
                client_id = ?event.client_id(),
                error = %e,
                "failed to persist event"
            );
            return Err(e);
        }
        let touched = apply_to_trainer(ts, event, &self.index);
        if let (Some(ledger), Some(booking)) = (ledger, &touched) {
            track_in_ledger(ledger, booking);
        }
        Ok(touched)
    }
}
