use std::collections::BTreeSet;
use std::time::Instant;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::{BookingError, EntityKind, Engine, policy, slots};

impl Engine {
    /// Open slots for every date in `[start_date, end_date]`.
    ///
    /// The whole report is computed under one read lock, so it reflects a
    /// single point in the trainer's history.
    pub async fn get_available_slots(
        &self,
        trainer_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        duration_override: Option<u32>,
    ) -> Result<SlotReport, BookingError> {
        if start_date > end_date {
            return Err(BookingError::validation(
                "end_date",
                "must not be before start_date",
            ));
        }
        if (end_date - start_date).num_days() >= MAX_QUERY_DAYS {
            return Err(BookingError::validation(
                "end_date",
                format!("range may cover at most {MAX_QUERY_DAYS} days"),
            ));
        }
        if let Some(minutes) = duration_override {
            policy::validate_session_length(minutes)?;
        }
        let ts = self.require_trainer(trainer_id)?;
        let now = self.now();

        let started = Instant::now();
        let guard = ts.read().await;
        let report = slots::generate(&guard, start_date, end_date, duration_override, now);
        drop(guard);
        metrics::histogram!(observability::SLOT_GENERATION_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// All seven days, Sunday first. Unconfigured days report the defaults.
    pub async fn get_weekly_availability(&self, trainer_id: Ulid) -> Result<Vec<WeeklyAvailability>, BookingError> {
        let ts = self.require_trainer(trainer_id)?;
        let guard = ts.read().await;
        Ok((0..7).map(|day| guard.availability_on_day(day)).collect())
    }

    pub async fn get_capacity(&self, trainer_id: Ulid) -> Result<CapacitySettings, BookingError> {
        let ts = self.require_trainer(trainer_id)?;
        Ok(ts.read().await.capacity())
    }

    pub async fn get_preferences(&self, trainer_id: Ulid) -> Result<BookingPreferences, BookingError> {
        let ts = self.require_trainer(trainer_id)?;
        Ok(ts.read().await.preferences())
    }

    /// Blocked intervals as declared, recurring ones unexpanded, ordered by first date.
    pub async fn list_blocked_intervals(&self, trainer_id: Ulid) -> Result<Vec<BlockedInterval>, BookingError> {
        let ts = self.require_trainer(trainer_id)?;
        let mut blocks = ts.read().await.blocks.clone();
        blocks.sort_by_key(|b| (b.date, b.start_time));
        Ok(blocks)
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, BookingError> {
        let owner = self.require_booking(booking_id)?;
        let ts = self.require_trainer(owner.trainer_id)?;
        let guard = ts.read().await;
        guard
            .booking(&booking_id)
            .cloned()
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking_id))
    }

    /// Bookings matching `filter`, ordered by date then start time.
    /// The filter must name a trainer or a client.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, BookingError> {
        if let (Some(from), Some(to)) = (filter.from, filter.to)
            && from > to
        {
            return Err(BookingError::validation("to", "must not be before from"));
        }
        let trainer_ids: BTreeSet<Ulid> = match (filter.trainer_id, filter.client_id) {
            (Some(trainer_id), _) => {
                self.require_trainer(trainer_id)?;
                BTreeSet::from([trainer_id])
            }
            (None, Some(client_id)) => {
                self.require_client(client_id)?;
                self.index
                    .bookings
                    .iter()
                    .filter(|e| e.value().client_id == client_id)
                    .map(|e| e.value().trainer_id)
                    .collect()
            }
            (None, None) => {
                return Err(BookingError::validation(
                    "filter",
                    "trainer_id or client_id is required",
                ));
            }
        };

        let mut out = Vec::new();
        for trainer_id in trainer_ids {
            let Some(ts) = self.trainer(&trainer_id) else {
                continue;
            };
            let guard = ts.read().await;
            let from = filter.from.unwrap_or(NaiveDate::MIN);
            let to = filter.to.unwrap_or(NaiveDate::MAX);
            out.extend(
                guard
                    .bookings
                    .range(from..=to)
                    .flat_map(|(_, day)| day.iter())
                    .filter(|b| filter.matches(b))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.date, b.start_time, b.id));
        Ok(out)
    }
}
