use std::collections::BTreeMap;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};

use crate::model::*;

use super::policy;
use super::recurrence;

// ── Slot Generation ───────────────────────────────────────────────

/// Cut one availability window into back-to-back sessions separated by `gap`.
/// A slot is kept while its end is at or before the window end.
pub fn window_slots(window: Span, duration: Minute, gap: Minute) -> Vec<Span> {
    let mut out = Vec::new();
    if duration <= 0 {
        return out;
    }
    let mut start = window.start;
    while start + duration <= window.end {
        out.push(Span::new(start, start + duration));
        start += duration + gap.max(0);
    }
    out
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `busy` must be merged (disjoint, sorted). Only the last busy span starting
/// before `slot.end` can reach into the slot.
fn overlaps_any(busy: &[Span], slot: &Span) -> bool {
    let right_bound = busy.partition_point(|b| b.start < slot.end);
    right_bound > 0 && busy[right_bound - 1].end > slot.start
}

/// ISO week (Monday–Sunday) containing `date`.
pub fn iso_week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    (monday, monday + Duration::days(6))
}

pub fn weekly_booked(state: &TrainerState, date: NaiveDate) -> u32 {
    let (monday, sunday) = iso_week_bounds(date);
    state.active_between(monday, sunday).count() as u32
}

/// Compute the open slots of one date.
pub fn day_slots(
    state: &TrainerState,
    date: NaiveDate,
    duration: u32,
    now: NaiveDateTime,
) -> DaySlots {
    let prefs = state.preferences();
    let cap = state.capacity();
    let booked = state.active_on(date).count() as u32;
    let week_booked = weekly_booked(state, date);

    let mut day = DaySlots {
        day_name: date.format("%A").to_string(),
        slots: Vec::new(),
        remaining_capacity: cap.max_daily_sessions.saturating_sub(booked),
        remaining_weekly_capacity: cap.max_weekly_sessions.saturating_sub(week_booked),
    };

    // Step 1: policy date gate. Step 7 (daily cap) clears everything, so check it up front.
    if policy::check_date(&prefs, date, now.date()).is_err() || booked >= cap.max_daily_sessions {
        return day;
    }

    // Steps 2-4: morning then evening windows cut into sessions.
    let row = state.availability_for(date);
    let gap = cap.break_between_sessions_minutes as Minute;
    let mut candidates: Vec<Span> = row
        .windows()
        .flat_map(|w| window_slots(w, duration as Minute, gap))
        .collect();

    let now_minute = (date == now.date()).then(|| minute_of(now.time()));
    candidates.retain(|s| {
        policy::within_booking_hours(&prefs, s.start_time())
            && now_minute.is_none_or(|m| s.start >= m)
    });

    // Steps 5-6: blocked occurrences and active bookings.
    let mut busy: Vec<Span> = recurrence::occurrences_on(&state.blocks, date)
        .into_iter()
        .map(|o| o.span)
        .chain(state.active_on(date).map(Booking::span))
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    day.slots = candidates
        .into_iter()
        .filter(|s| !overlaps_any(&busy, s))
        .map(|s| Slot {
            date,
            start_time: s.start_time(),
            end_time: s.end_time(),
            duration_minutes: s.duration_minutes() as u32,
        })
        .collect();
    day
}

/// Slots for every date in the inclusive range, from one consistent view of `state`.
pub fn generate(
    state: &TrainerState,
    start_date: NaiveDate,
    end_date: NaiveDate,
    duration_override: Option<u32>,
    now: NaiveDateTime,
) -> SlotReport {
    let cap = state.capacity();
    let duration = duration_override.unwrap_or(cap.session_duration_minutes);

    let days: BTreeMap<NaiveDate, DaySlots> = start_date
        .iter_days()
        .take_while(|d| *d <= end_date)
        .map(|d| (d, day_slots(state, d, duration, now)))
        .collect();

    SlotReport {
        trainer_id: state.id,
        start_date,
        end_date,
        session_duration_minutes: duration,
        break_between_sessions_minutes: cap.break_between_sessions_minutes,
        max_daily_sessions: cap.max_daily_sessions,
        max_weekly_sessions: cap.max_weekly_sessions,
        days,
    }
}
