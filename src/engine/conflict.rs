use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;

use super::error::{BookingError, CapacityScope, ConflictingBooking, Party};
use super::policy;
use super::recurrence;
use super::slots::weekly_booked;

/// A proposed booking interval. `exclude` skips the booking being rescheduled.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub date: NaiveDate,
    pub span: Span,
    pub exclude: Option<Ulid>,
}

/// Run every constraint layer in order; the first failure wins.
/// Caller holds the client lock and the trainer write lock.
pub(crate) fn check_candidate(
    trainer: &TrainerState,
    client: &ClientLedger,
    candidate: &Candidate,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    let prefs = trainer.preferences();
    policy::check_booking_window(&prefs, candidate.date, candidate.span.start_time(), now)?;
    check_trainer_overlap(trainer, candidate)?;
    check_client_overlap(client, candidate)?;
    check_blocked(trainer, candidate)?;
    check_capacity(trainer, candidate)
}

pub(crate) fn check_trainer_overlap(
    trainer: &TrainerState,
    candidate: &Candidate,
) -> Result<(), BookingError> {
    let conflicts: Vec<ConflictingBooking> = trainer
        .overlapping(candidate.date, candidate.span)
        .filter(|b| Some(b.id) != candidate.exclude)
        .map(|b| ConflictingBooking {
            booking_id: b.id,
            trainer_id: b.trainer_id,
            date: b.date,
            start_time: b.start_time,
            end_time: b.end_time,
        })
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(BookingError::Overlap {
            party: Party::Trainer,
            conflicts,
        })
    }
}

pub(crate) fn check_client_overlap(
    client: &ClientLedger,
    candidate: &Candidate,
) -> Result<(), BookingError> {
    let conflicts: Vec<ConflictingBooking> = client
        .overlapping(candidate.date, candidate.span)
        .filter(|b| Some(b.booking_id) != candidate.exclude)
        .map(|b| ConflictingBooking {
            booking_id: b.booking_id,
            trainer_id: b.trainer_id,
            date: b.date,
            start_time: b.span.start_time(),
            end_time: b.span.end_time(),
        })
        .collect();
    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(BookingError::Overlap {
            party: Party::Client,
            conflicts,
        })
    }
}

pub(crate) fn check_blocked(trainer: &TrainerState, candidate: &Candidate) -> Result<(), BookingError> {
    let hit = recurrence::occurrences_on(&trainer.blocks, candidate.date)
        .into_iter()
        .find(|o| o.span.overlaps(&candidate.span));
    match hit {
        None => Ok(()),
        Some(o) => {
            let reason = trainer
                .blocks
                .iter()
                .find(|b| b.id == o.block_id)
                .and_then(|b| b.reason.clone());
            Err(BookingError::Blocked {
                block_id: o.block_id,
                date: o.date,
                start_time: o.span.start_time(),
                end_time: o.span.end_time(),
                reason,
            })
        }
    }
}

/// Daily cap, then the ISO-week cap. The excluded booking does not count.
pub(crate) fn check_capacity(trainer: &TrainerState, candidate: &Candidate) -> Result<(), BookingError> {
    let cap = trainer.capacity();
    let excluded_on = |date_matches: &dyn Fn(NaiveDate) -> bool| -> u32 {
        candidate
            .exclude
            .and_then(|id| trainer.booking(&id))
            .filter(|b| b.is_active() && date_matches(b.date))
            .map_or(0, |_| 1)
    };

    let daily = trainer.active_on(candidate.date).count() as u32
        - excluded_on(&|d| d == candidate.date);
    if daily >= cap.max_daily_sessions {
        return Err(BookingError::Capacity {
            scope: CapacityScope::Daily,
            limit: cap.max_daily_sessions,
            booked: daily,
        });
    }

    let (monday, sunday) = super::slots::iso_week_bounds(candidate.date);
    let weekly = weekly_booked(trainer, candidate.date)
        - excluded_on(&|d| monday <= d && d <= sunday);
    if weekly >= cap.max_weekly_sessions {
        return Err(BookingError::Capacity {
            scope: CapacityScope::Weekly,
            limit: cap.max_weekly_sessions,
            booked: weekly,
        });
    }
    Ok(())
}
