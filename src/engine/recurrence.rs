use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::model::*;

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateWindow start must not be after end");
        Self { start, end }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// A blocked interval pinned to one concrete date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub block_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

/// Does `block` apply on `date`?
///
/// Recurring blocks repeat from their anchor `date` up to and including
/// `recurrence.until`: daily every day, weekly on the anchor's weekday,
/// monthly on the anchor's day-of-month (months lacking that day are skipped).
pub fn occurs_on(block: &BlockedInterval, date: NaiveDate) -> bool {
    let Some(rec) = block.recurrence else {
        return date == block.date;
    };
    if date < block.date || rec.until.is_some_and(|until| date > until) {
        return false;
    }
    match rec.kind {
        RecurrenceKind::Daily => true,
        RecurrenceKind::Weekly => date.weekday() == block.date.weekday(),
        RecurrenceKind::Monthly => date.day() == block.date.day(),
    }
}

/// Expand one blocked interval into its concrete occurrences inside `window`.
pub fn expand(block: &BlockedInterval, window: DateWindow) -> Vec<Occurrence> {
    let first = block.date.max(window.start);
    let last = match block.recurrence {
        None => block.date.min(window.end),
        Some(rec) => rec.until.map_or(window.end, |until| until.min(window.end)),
    };
    if first > last {
        return Vec::new();
    }
    let span = block.span();
    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| occurs_on(block, *d))
        .map(|date| Occurrence {
            block_id: block.id,
            date,
            span,
        })
        .collect()
}

/// All occurrences on a single date, sorted by start.
pub fn occurrences_on(blocks: &[BlockedInterval], date: NaiveDate) -> Vec<Occurrence> {
    let mut out: Vec<Occurrence> = blocks
        .iter()
        .filter(|b| occurs_on(b, date))
        .map(|b| Occurrence {
            block_id: b.id,
            date,
            span: b.span(),
        })
        .collect();
    out.sort_by_key(|o| o.span.start);
    out
}
