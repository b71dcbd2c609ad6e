use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::limits::*;
use crate::model::*;

use super::error::{BookingError, PolicyViolation};

pub fn last_bookable_date(prefs: &BookingPreferences, today: NaiveDate) -> NaiveDate {
    today + Duration::days(i64::from(prefs.advance_booking_days))
}

/// Date-level gate shared by slot generation and request validation.
pub fn check_date(
    prefs: &BookingPreferences,
    date: NaiveDate,
    today: NaiveDate,
) -> Result<(), PolicyViolation> {
    if date < today {
        return Err(PolicyViolation::InPast {
            date,
            start_time: NaiveTime::MIN,
        });
    }
    let last_bookable = last_bookable_date(prefs, today);
    if date > last_bookable {
        return Err(PolicyViolation::BeyondAdvanceWindow {
            date,
            last_bookable,
        });
    }
    if !prefs.allow_weekend_booking && is_weekend(date) {
        return Err(PolicyViolation::WeekendNotAllowed { date });
    }
    Ok(())
}

pub fn within_booking_hours(prefs: &BookingPreferences, start: NaiveTime) -> bool {
    prefs.earliest_booking_time <= start && start <= prefs.latest_booking_time
}

/// Full policy gate for a candidate booking start.
pub fn check_booking_window(
    prefs: &BookingPreferences,
    date: NaiveDate,
    start: NaiveTime,
    now: NaiveDateTime,
) -> Result<(), PolicyViolation> {
    if date.and_time(start) < now {
        return Err(PolicyViolation::InPast {
            date,
            start_time: start,
        });
    }
    check_date(prefs, date, now.date())?;
    if !within_booking_hours(prefs, start) {
        return Err(PolicyViolation::OutsideBookingHours {
            start_time: start,
            earliest: prefs.earliest_booking_time,
            latest: prefs.latest_booking_time,
        });
    }
    Ok(())
}

pub fn cancellation_deadline(prefs: &BookingPreferences, booking: &Booking) -> NaiveDateTime {
    booking.start_datetime() - Duration::hours(i64::from(prefs.cancellation_hours))
}

/// Pending bookings cancel freely; confirmed ones only up to the deadline.
pub fn check_cancellable(
    prefs: &BookingPreferences,
    booking: &Booking,
    now: NaiveDateTime,
) -> Result<(), BookingError> {
    check_transition(booking.status, BookingStatus::Cancelled)?;
    if booking.status == BookingStatus::Confirmed {
        let deadline = cancellation_deadline(prefs, booking);
        if now > deadline {
            return Err(PolicyViolation::CancellationDeadlinePassed { deadline }.into());
        }
    }
    Ok(())
}

/// The only legal moves: Pending → Confirmed, Pending → Cancelled, Confirmed → Cancelled.
pub fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), BookingError> {
    use BookingStatus::*;
    match (from, to) {
        (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) => Ok(()),
        _ => Err(BookingError::State { from, to }),
    }
}

pub fn validate_capacity(settings: &CapacitySettings) -> Result<(), BookingError> {
    if settings.max_daily_sessions == 0 {
        return Err(BookingError::validation(
            "max_daily_sessions",
            "must be at least 1",
        ));
    }
    if u64::from(settings.max_daily_sessions) * 7 > u64::from(settings.max_weekly_sessions) {
        return Err(BookingError::validation(
            "max_weekly_sessions",
            format!(
                "must be at least 7 x max_daily_sessions ({})",
                u64::from(settings.max_daily_sessions) * 7
            ),
        ));
    }
    validate_session_length(settings.session_duration_minutes)?;
    if settings.break_between_sessions_minutes > MAX_BREAK_MINUTES {
        return Err(BookingError::validation(
            "break_between_sessions_minutes",
            format!("must be at most {MAX_BREAK_MINUTES}"),
        ));
    }
    Ok(())
}

pub fn validate_session_length(minutes: u32) -> Result<(), BookingError> {
    if !(MIN_SESSION_MINUTES..=MAX_SESSION_MINUTES).contains(&minutes) {
        return Err(BookingError::validation(
            "session_duration_minutes",
            format!("must be between {MIN_SESSION_MINUTES} and {MAX_SESSION_MINUTES}"),
        ));
    }
    Ok(())
}

pub fn validate_preferences(prefs: &BookingPreferences) -> Result<(), BookingError> {
    if prefs.earliest_booking_time > prefs.latest_booking_time {
        return Err(BookingError::validation(
            "earliest_booking_time",
            "must not be after latest_booking_time",
        ));
    }
    if prefs.advance_booking_days > MAX_ADVANCE_BOOKING_DAYS {
        return Err(BookingError::validation(
            "advance_booking_days",
            format!("must be at most {MAX_ADVANCE_BOOKING_DAYS}"),
        ));
    }
    if prefs.cancellation_hours > MAX_CANCELLATION_HOURS {
        return Err(BookingError::validation(
            "cancellation_hours",
            format!("must be at most {MAX_CANCELLATION_HOURS}"),
        ));
    }
    Ok(())
}

pub fn validate_availability(row: &WeeklyAvailability) -> Result<(), BookingError> {
    if row.day_of_week > 6 {
        return Err(BookingError::validation(
            "day_of_week",
            "must be 0 (Sunday) through 6 (Saturday)",
        ));
    }
    if row.morning.available && row.morning.start >= row.morning.end {
        return Err(BookingError::validation(
            "morning",
            "start must be before end",
        ));
    }
    if row.evening.available && row.evening.start >= row.evening.end {
        return Err(BookingError::validation(
            "evening",
            "start must be before end",
        ));
    }
    Ok(())
}

pub fn validate_block(block: &BlockedInterval) -> Result<(), BookingError> {
    if block.start_time >= block.end_time {
        return Err(BookingError::validation(
            "end_time",
            "blocked interval must end after it starts",
        ));
    }
    if let Some(until) = block.recurrence.and_then(|r| r.until)
        && until < block.date {
            return Err(BookingError::validation(
                "recurrence.until",
                "must not be before the first date",
            ));
        }
    if block.reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
        return Err(BookingError::LimitExceeded("reason too long"));
    }
    Ok(())
}
