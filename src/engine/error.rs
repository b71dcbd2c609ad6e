use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{hhmm, Actor, BookingStatus};

/// An existing booking that a candidate interval collides with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictingBooking {
    pub booking_id: Ulid,
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Trainer,
    Client,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Party::Trainer => "trainer",
            Party::Client => "client",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityScope {
    Daily,
    Weekly,
}

impl fmt::Display for CapacityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CapacityScope::Daily => "daily",
            CapacityScope::Weekly => "weekly",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Trainer,
    Client,
    Booking,
    BlockedInterval,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Trainer => "trainer",
            EntityKind::Client => "client",
            EntityKind::Booking => "booking",
            EntityKind::BlockedInterval => "blocked interval",
        })
    }
}

/// Booking-window and cancellation rules a request broke.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PolicyViolation {
    #[error("{date} {} is in the past", .start_time.format("%H:%M"))]
    InPast {
        date: NaiveDate,
        #[serde(with = "hhmm")]
        start_time: NaiveTime,
    },
    #[error("{date} is beyond the advance booking window (last bookable date {last_bookable})")]
    BeyondAdvanceWindow {
        date: NaiveDate,
        last_bookable: NaiveDate,
    },
    #[error("weekend bookings are not allowed ({date})")]
    WeekendNotAllowed { date: NaiveDate },
    #[error(
        "start time {} is outside booking hours {}-{}",
        .start_time.format("%H:%M"),
        .earliest.format("%H:%M"),
        .latest.format("%H:%M")
    )]
    OutsideBookingHours {
        #[serde(with = "hhmm")]
        start_time: NaiveTime,
        #[serde(with = "hhmm")]
        earliest: NaiveTime,
        #[serde(with = "hhmm")]
        latest: NaiveTime,
    },
    #[error("trainer does not accept self-booked sessions")]
    SelfBookingDisabled,
    #[error("cancellation deadline {deadline} has passed")]
    CancellationDeadlinePassed { deadline: NaiveDateTime },
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("{0}")]
    Policy(#[from] PolicyViolation),
    #[error("{party} already has a session at {}", first_start(.conflicts))]
    Overlap {
        party: Party,
        conflicts: Vec<ConflictingBooking>,
    },
    #[error(
        "{date} {}-{} falls inside a blocked interval",
        .start_time.format("%H:%M"),
        .end_time.format("%H:%M")
    )]
    Blocked {
        block_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
        reason: Option<String>,
    },
    #[error("{scope} capacity of {limit} sessions reached ({booked} booked)")]
    Capacity {
        scope: CapacityScope,
        limit: u32,
        booked: u32,
    },
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Ulid },
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: EntityKind, id: Ulid },
    #[error("illegal status transition {from} -> {to}")]
    State { from: BookingStatus, to: BookingStatus },
    #[error("{actor} may not act on booking {booking_id}")]
    Forbidden { actor: Actor, booking_id: Ulid },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

fn first_start(conflicts: &[ConflictingBooking]) -> String {
    conflicts
        .first()
        .map(|c| c.start_time.format("%H:%M").to_string())
        .unwrap_or_else(|| "?".into())
}

impl BookingError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        BookingError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(kind: EntityKind, id: Ulid) -> Self {
        BookingError::NotFound { kind, id }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::Validation { .. } => "validation_error",
            BookingError::Policy(_) => "policy_violation",
            BookingError::Overlap { .. } => "overlap_conflict",
            BookingError::Blocked { .. } => "blocked_conflict",
            BookingError::Capacity { .. } => "capacity_exceeded",
            BookingError::NotFound { .. } => "not_found",
            BookingError::AlreadyExists { .. } => "already_exists",
            BookingError::State { .. } => "state_error",
            BookingError::Forbidden { .. } => "forbidden",
            BookingError::LimitExceeded(_) => "limit_exceeded",
            BookingError::Storage(_) => "storage_error",
        }
    }

    /// Only storage faults are fatal; everything else is user-actionable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BookingError::Storage(_))
    }

    /// Structured detail for callers that render the rejection.
    pub fn details(&self) -> serde_json::Value {
        match self {
            BookingError::Validation { field, .. } => json!({ "field": field }),
            BookingError::Policy(v) => json!(v),
            BookingError::Overlap { party, conflicts } => {
                json!({ "party": party, "conflicts": conflicts })
            }
            BookingError::Blocked {
                block_id,
                date,
                start_time,
                end_time,
                reason,
            } => json!({
                "block_id": block_id,
                "date": date,
                "start_time": start_time.format("%H:%M").to_string(),
                "end_time": end_time.format("%H:%M").to_string(),
                "reason": reason,
            }),
            BookingError::Capacity { scope, limit, booked } => {
                json!({ "scope": scope, "limit": limit, "booked": booked })
            }
            BookingError::NotFound { kind, id } | BookingError::AlreadyExists { kind, id } => {
                json!({ "kind": kind, "id": id })
            }
            BookingError::State { from, to } => json!({ "from": from, "to": to }),
            BookingError::Forbidden { actor, booking_id } => {
                json!({ "actor": actor, "booking_id": booking_id })
            }
            BookingError::LimitExceeded(_) | BookingError::Storage(_) => serde_json::Value::Null,
        }
    }
}
