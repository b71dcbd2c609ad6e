use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{self, Candidate};
use super::policy;
use super::{
    BookingError, BookingOwner, EntityKind, Engine, PolicyViolation, SharedClientLedger,
    SharedTrainerState, WalCommand,
};

/// Who asked for the booking; decides approval and self-booking rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Client,
    Trainer,
}

impl Source {
    fn label(self) -> &'static str {
        match self {
            Source::Client => "request_booking",
            Source::Trainer => "create_booking",
        }
    }
}

fn check_len(value: &Option<String>, max: usize, what: &'static str) -> Result<(), BookingError> {
    if value.as_ref().is_some_and(|v| v.len() > max) {
        return Err(BookingError::LimitExceeded(what));
    }
    Ok(())
}

/// Session interval from a start time and length; must finish before midnight.
fn session_span(start: NaiveTime, minutes: Minute) -> Result<Span, BookingError> {
    let start = minute_of(start);
    let end = start + minutes;
    if minutes <= 0 || end >= MINUTES_PER_DAY {
        return Err(BookingError::validation(
            "start_time",
            "session must end before midnight",
        ));
    }
    Ok(Span::new(start, end))
}

fn record_rejection(op: &'static str, err: &BookingError) {
    metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "code" => err.code()).increment(1);
    if !err.is_fatal() {
        debug!(op, code = err.code(), "rejected: {err}");
    }
}

fn record_commit(action: &'static str, booking: &Booking) {
    metrics::counter!(
        observability::BOOKINGS_TOTAL,
        "action" => action,
        "status" => booking.status.as_str()
    )
    .increment(1);
    info!(
        booking_id = %booking.id,
        trainer_id = %booking.trainer_id,
        client_id = %booking.client_id,
        date = %booking.date,
        start = %booking.start_time.format("%H:%M"),
        status = %booking.status,
        "{action}"
    );
}

fn authorize(actor: Actor, booking_id: Ulid, owner: BookingOwner, trainer_only: bool) -> Result<(), BookingError> {
    let allowed = match actor {
        Actor::Trainer(id) => id == owner.trainer_id,
        Actor::Client(id) => !trainer_only && id == owner.client_id,
    };
    if allowed {
        Ok(())
    } else {
        Err(BookingError::Forbidden { actor, booking_id })
    }
}

impl Engine {
    // ── Registration ─────────────────────────────────────

    /// The id is claimed in the map before the WAL append; the new state stays
    /// write-locked until the append resolves and is withdrawn if it fails.
    pub async fn register_trainer(&self, id: Ulid, name: Option<String>) -> Result<(), BookingError> {
        check_len(&name, MAX_NAME_LEN, "trainer name too long")?;
        let _gate = self.write_gate.read().await;
        let state = Arc::new(RwLock::new(TrainerState::new(id, name.clone())));
        let _claim = state
            .try_write()
            .map_err(|_| BookingError::Storage("new trainer state already locked".into()))?;
        match self.trainers.entry(id) {
            Entry::Occupied(_) => {
                return Err(BookingError::AlreadyExists {
                    kind: EntityKind::Trainer,
                    id,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(state.clone());
            }
        }
        if let Err(e) = self.wal_append(&Event::TrainerRegistered { id, name }).await {
            self.trainers.remove(&id);
            return Err(e);
        }
        metrics::gauge!(observability::TRAINERS_LOADED).set(self.trainers.len() as f64);
        info!(trainer_id = %id, "trainer registered");
        Ok(())
    }

    pub async fn register_client(&self, id: Ulid, name: Option<String>) -> Result<(), BookingError> {
        check_len(&name, MAX_NAME_LEN, "client name too long")?;
        let _gate = self.write_gate.read().await;
        let ledger = Arc::new(Mutex::new(ClientLedger::new(id, name.clone())));
        let _claim = ledger
            .try_lock()
            .map_err(|_| BookingError::Storage("new client ledger already locked".into()))?;
        match self.clients.entry(id) {
            Entry::Occupied(_) => {
                return Err(BookingError::AlreadyExists {
                    kind: EntityKind::Client,
                    id,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(ledger.clone());
            }
        }
        if let Err(e) = self.wal_append(&Event::ClientRegistered { id, name }).await {
            self.clients.remove(&id);
            return Err(e);
        }
        info!(client_id = %id, "client registered");
        Ok(())
    }

    // ── Trainer settings ─────────────────────────────────

    pub async fn set_weekly_availability(&self, row: WeeklyAvailability) -> Result<(), BookingError> {
        policy::validate_availability(&row)?;
        let _gate = self.write_gate.read().await;
        let ts = self.require_trainer(row.trainer_id)?;
        let mut guard = ts.write().await;
        let event = Event::AvailabilitySet {
            trainer_id: row.trainer_id,
            availability: row,
        };
        self.commit(&mut guard, None, &event).await?;
        info!(trainer_id = %row.trainer_id, day = row.day_of_week, "availability updated");
        Ok(())
    }

    pub async fn set_capacity(&self, trainer_id: Ulid, settings: CapacitySettings) -> Result<(), BookingError> {
        policy::validate_capacity(&settings)?;
        let _gate = self.write_gate.read().await;
        let ts = self.require_trainer(trainer_id)?;
        let mut guard = ts.write().await;
        self.commit(&mut guard, None, &Event::CapacitySet { trainer_id, settings })
            .await?;
        info!(%trainer_id, ?settings, "capacity updated");
        Ok(())
    }

    pub async fn set_preferences(
        &self,
        trainer_id: Ulid,
        preferences: BookingPreferences,
    ) -> Result<(), BookingError> {
        policy::validate_preferences(&preferences)?;
        let _gate = self.write_gate.read().await;
        let ts = self.require_trainer(trainer_id)?;
        let mut guard = ts.write().await;
        self.commit(&mut guard, None, &Event::PreferencesSet { trainer_id, preferences })
            .await?;
        info!(%trainer_id, "booking preferences updated");
        Ok(())
    }

    // ── Blocked intervals ────────────────────────────────

    pub async fn add_blocked_interval(&self, block: BlockedInterval) -> Result<(), BookingError> {
        policy::validate_block(&block)?;
        let _gate = self.write_gate.read().await;
        let ts = self.require_trainer(block.trainer_id)?;
        let mut guard = ts.write().await;
        if guard.blocks.len() >= MAX_BLOCKS_PER_TRAINER {
            return Err(BookingError::LimitExceeded("too many blocked intervals"));
        }
        let (id, trainer_id, date) = (block.id, block.trainer_id, block.date);
        match self.index.blocks.entry(id) {
            Entry::Occupied(_) => {
                return Err(BookingError::AlreadyExists {
                    kind: EntityKind::BlockedInterval,
                    id,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(trainer_id);
            }
        }
        if let Err(e) = self.commit(&mut guard, None, &Event::BlockAdded { block }).await {
            self.index.blocks.remove(&id);
            return Err(e);
        }
        info!(block_id = %id, %trainer_id, %date, "blocked interval added");
        Ok(())
    }

    /// Returns the removed interval.
    pub async fn remove_blocked_interval(&self, id: Ulid) -> Result<BlockedInterval, BookingError> {
        let _gate = self.write_gate.read().await;
        let trainer_id = self
            .index
            .blocks
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(|| BookingError::not_found(EntityKind::BlockedInterval, id))?;
        let ts = self.require_trainer(trainer_id)?;
        let mut guard = ts.write().await;
        let removed = guard
            .blocks
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or_else(|| BookingError::not_found(EntityKind::BlockedInterval, id))?;
        self.commit(&mut guard, None, &Event::BlockRemoved { id, trainer_id })
            .await?;
        info!(block_id = %id, %trainer_id, "blocked interval removed");
        Ok(removed)
    }

    // ── Booking workflow ─────────────────────────────────

    /// Client self-booking. The session length comes from the trainer's
    /// capacity settings; the booking may start Pending when approval is required.
    pub async fn request_booking(&self, req: BookingRequest) -> Result<BookingOutcome, BookingError> {
        self.book(req, Source::Client)
            .await
            .inspect_err(|e| record_rejection(Source::Client.label(), e))
    }

    /// Trainer-direct booking. An explicit end time overrides the session
    /// length; the result is always Confirmed.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<BookingOutcome, BookingError> {
        self.book(req, Source::Trainer)
            .await
            .inspect_err(|e| record_rejection(Source::Trainer.label(), e))
    }

    async fn book(&self, req: BookingRequest, source: Source) -> Result<BookingOutcome, BookingError> {
        if source == Source::Client && req.end_time.is_some() {
            return Err(BookingError::validation(
                "end_time",
                "client requests use the trainer's session length",
            ));
        }
        check_len(&req.notes, MAX_NOTES_LEN, "notes too long")?;
        check_len(&req.session_type, MAX_SESSION_TYPE_LEN, "session type too long")?;
        check_len(&req.timezone, MAX_TIMEZONE_LEN, "timezone too long")?;

        let gate = self.write_gate.read().await;
        let client = self.require_client(req.client_id)?;
        let trainer = self.require_trainer(req.trainer_id)?;

        // Claim the id before locking; a failed attempt gives it back.
        let id = req.id;
        match self.index.bookings.entry(id) {
            Entry::Occupied(_) => {
                return Err(BookingError::AlreadyExists {
                    kind: EntityKind::Booking,
                    id,
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(BookingOwner {
                    trainer_id: req.trainer_id,
                    client_id: req.client_id,
                });
            }
        }
        let committed = self.insert_booking(req, source, &client, &trainer).await;
        if committed.is_err() {
            self.index.bookings.remove(&id);
        }
        let booking = committed?;
        drop(gate);

        record_commit(source.label(), &booking);
        let status = booking.status;
        let mut outcome = BookingOutcome::new(booking);
        if status == BookingStatus::Confirmed {
            self.sync_created(&mut outcome).await;
        }
        Ok(outcome)
    }

    /// Validate and commit under the client and trainer locks, in that order.
    async fn insert_booking(
        &self,
        req: BookingRequest,
        source: Source,
        client: &SharedClientLedger,
        trainer: &SharedTrainerState,
    ) -> Result<Booking, BookingError> {
        let mut ledger = client.lock().await;
        let mut ts = trainer.write().await;
        if ts.booking_count() >= MAX_BOOKINGS_PER_TRAINER {
            return Err(BookingError::LimitExceeded("too many bookings for trainer"));
        }

        let prefs = ts.preferences();
        if source == Source::Client && !prefs.allow_self_booking {
            return Err(PolicyViolation::SelfBookingDisabled.into());
        }
        let span = match req.end_time {
            Some(end) => {
                if end <= req.start_time {
                    return Err(BookingError::validation("end_time", "must be after start_time"));
                }
                let minutes = minute_of(end) - minute_of(req.start_time);
                policy::validate_session_length(minutes as u32)?;
                session_span(req.start_time, minutes)?
            }
            None => session_span(req.start_time, ts.capacity().session_duration_minutes as Minute)?,
        };

        let now = self.now();
        let candidate = Candidate {
            date: req.date,
            span,
            exclude: None,
        };
        conflict::check_candidate(&ts, &ledger, &candidate, now)?;

        let status = if source == Source::Client && prefs.require_approval {
            BookingStatus::Pending
        } else {
            BookingStatus::Confirmed
        };
        let booking = Booking {
            id: req.id,
            trainer_id: req.trainer_id,
            client_id: req.client_id,
            date: req.date,
            start_time: span.start_time(),
            end_time: span.end_time(),
            status,
            notes: req.notes,
            session_type: req.session_type,
            timezone: req.timezone,
            external_sync_ref: None,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.commit(&mut ts, Some(&mut *ledger), &event).await?;
        Ok(booking)
    }

    /// Trainer-only status change, cancellation included. Cancelling goes
    /// through the cancellation rules.
    pub async fn update_booking_status(
        &self,
        booking_id: Ulid,
        actor: Actor,
        status: BookingStatus,
    ) -> Result<BookingOutcome, BookingError> {
        if status == BookingStatus::Cancelled {
            let allowed = self
                .require_booking(booking_id)
                .and_then(|owner| authorize(actor, booking_id, owner, true));
            if let Err(e) = allowed {
                record_rejection("update_booking_status", &e);
                return Err(e);
            }
            return self.cancel_booking(booking_id, actor).await;
        }
        self.change_status(booking_id, actor, status)
            .await
            .inspect_err(|e| record_rejection("update_booking_status", e))
    }

    async fn change_status(
        &self,
        booking_id: Ulid,
        actor: Actor,
        status: BookingStatus,
    ) -> Result<BookingOutcome, BookingError> {
        let owner = self.require_booking(booking_id)?;
        authorize(actor, booking_id, owner, true)?;

        let gate = self.write_gate.read().await;
        let client = self.require_client(owner.client_id)?;
        let trainer = self.require_trainer(owner.trainer_id)?;
        let mut ledger = client.lock().await;
        let mut ts = trainer.write().await;
        let current = ts
            .booking(&booking_id)
            .map(|b| b.status)
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
        policy::check_transition(current, status)?;

        let event = Event::BookingStatusChanged {
            id: booking_id,
            trainer_id: owner.trainer_id,
            client_id: owner.client_id,
            status,
            at: self.now(),
        };
        let booking = self
            .commit(&mut ts, Some(&mut *ledger), &event)
            .await?
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
        drop(ts);
        drop(ledger);
        drop(gate);

        record_commit("update_booking_status", &booking);
        let mut outcome = BookingOutcome::new(booking);
        if status == BookingStatus::Confirmed {
            self.sync_created(&mut outcome).await;
        }
        Ok(outcome)
    }

    /// Either party may cancel. Confirmed bookings must be cancelled before the
    /// trainer's cancellation deadline; pending ones any time.
    pub async fn cancel_booking(&self, booking_id: Ulid, actor: Actor) -> Result<BookingOutcome, BookingError> {
        self.cancel(booking_id, actor)
            .await
            .inspect_err(|e| record_rejection("cancel_booking", e))
    }

    async fn cancel(&self, booking_id: Ulid, actor: Actor) -> Result<BookingOutcome, BookingError> {
        let owner = self.require_booking(booking_id)?;
        authorize(actor, booking_id, owner, false)?;

        let gate = self.write_gate.read().await;
        let client = self.require_client(owner.client_id)?;
        let trainer = self.require_trainer(owner.trainer_id)?;
        let mut ledger = client.lock().await;
        let mut ts = trainer.write().await;
        let now = self.now();
        {
            let booking = ts
                .booking(&booking_id)
                .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
            policy::check_cancellable(&ts.preferences(), booking, now)?;
        }

        let event = Event::BookingStatusChanged {
            id: booking_id,
            trainer_id: owner.trainer_id,
            client_id: owner.client_id,
            status: BookingStatus::Cancelled,
            at: now,
        };
        let booking = self
            .commit(&mut ts, Some(&mut *ledger), &event)
            .await?
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
        drop(ts);
        drop(ledger);
        drop(gate);

        record_commit("cancel_booking", &booking);
        let mut outcome = BookingOutcome::new(booking);
        if outcome.booking.external_sync_ref.is_some() {
            self.sync_deleted(&mut outcome).await;
        }
        Ok(outcome)
    }

    /// Move a live booking to a new date and start time, keeping its length.
    /// The booking does not conflict with itself.
    pub async fn reschedule_booking(
        &self,
        booking_id: Ulid,
        actor: Actor,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<BookingOutcome, BookingError> {
        self.reschedule(booking_id, actor, date, start_time)
            .await
            .inspect_err(|e| record_rejection("reschedule_booking", e))
    }

    async fn reschedule(
        &self,
        booking_id: Ulid,
        actor: Actor,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<BookingOutcome, BookingError> {
        let owner = self.require_booking(booking_id)?;
        authorize(actor, booking_id, owner, false)?;

        let gate = self.write_gate.read().await;
        let client = self.require_client(owner.client_id)?;
        let trainer = self.require_trainer(owner.trainer_id)?;
        let mut ledger = client.lock().await;
        let mut ts = trainer.write().await;
        let (status, minutes) = ts
            .booking(&booking_id)
            .map(|b| (b.status, b.span().duration_minutes()))
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
        if !status.is_active() {
            return Err(BookingError::State {
                from: status,
                to: status,
            });
        }
        let span = session_span(start_time, minutes)?;
        let now = self.now();
        let candidate = Candidate {
            date,
            span,
            exclude: Some(booking_id),
        };
        conflict::check_candidate(&ts, &ledger, &candidate, now)?;

        let event = Event::BookingRescheduled {
            id: booking_id,
            trainer_id: owner.trainer_id,
            client_id: owner.client_id,
            date,
            start_time: span.start_time(),
            end_time: span.end_time(),
            at: now,
        };
        let booking = self
            .commit(&mut ts, Some(&mut *ledger), &event)
            .await?
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))?;
        drop(ts);
        drop(ledger);
        drop(gate);

        record_commit("reschedule_booking", &booking);
        let mut outcome = BookingOutcome::new(booking);
        if outcome.booking.external_sync_ref.is_some() {
            self.sync_updated(&mut outcome).await;
        }
        Ok(outcome)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    /// Writers are paused for the duration.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let _exclusive = self.write_gate.write().await;

        let clients: Vec<_> = self.clients.iter().map(|e| e.value().clone()).collect();
        let trainers: Vec<_> = self.trainers.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::new();

        // Clients first so replayed bookings find their ledgers.
        for client in &clients {
            let ledger = client.lock().await;
            snapshot.push(Event::ClientRegistered {
                id: ledger.id,
                name: ledger.name.clone(),
            });
        }
        for trainer in &trainers {
            let ts = trainer.read().await;
            snapshot.push(Event::TrainerRegistered {
                id: ts.id,
                name: ts.name.clone(),
            });
            snapshot.extend(ts.availability.iter().flatten().map(|row| Event::AvailabilitySet {
                trainer_id: ts.id,
                availability: *row,
            }));
            if let Some(settings) = ts.capacity {
                snapshot.push(Event::CapacitySet {
                    trainer_id: ts.id,
                    settings,
                });
            }
            if let Some(preferences) = ts.preferences {
                snapshot.push(Event::PreferencesSet {
                    trainer_id: ts.id,
                    preferences,
                });
            }
            snapshot.extend(ts.blocks.iter().map(|b| Event::BlockAdded { block: b.clone() }));
            snapshot.extend(
                ts.bookings
                    .values()
                    .flatten()
                    .map(|b| Event::BookingCreated { booking: b.clone() }),
            );
        }

        let events = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(events, "WAL compacted");
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
