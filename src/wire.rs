//! Newline-delimited JSON protocol: one request object per line in, one
//! response object per line out.
//!
//! ```text
//! → {"op":"get_available_slots","trainer_id":"01J…","start_date":"2024-06-03","end_date":"2024-06-09"}
//! ← {"ok":true,"result":{...}}
//! ← {"ok":false,"error":{"code":"overlap_conflict","message":"...","details":{...}}}
//! ```

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{BookingError, Engine};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    RegisterTrainer {
        #[serde(default = "Ulid::new")]
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
    },
    RegisterClient {
        #[serde(default = "Ulid::new")]
        id: Ulid,
        #[serde(default)]
        name: Option<String>,
    },
    SetWeeklyAvailability(WeeklyAvailability),
    GetWeeklyAvailability {
        trainer_id: Ulid,
    },
    SetCapacity {
        trainer_id: Ulid,
        settings: CapacitySettings,
    },
    GetCapacity {
        trainer_id: Ulid,
    },
    SetPreferences {
        trainer_id: Ulid,
        preferences: BookingPreferences,
    },
    GetPreferences {
        trainer_id: Ulid,
    },
    AddBlockedInterval(BlockedInterval),
    RemoveBlockedInterval {
        id: Ulid,
    },
    ListBlockedIntervals {
        trainer_id: Ulid,
    },
    GetAvailableSlots {
        trainer_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        #[serde(default)]
        duration_minutes: Option<u32>,
    },
    RequestBooking(BookingRequest),
    CreateBooking(BookingRequest),
    UpdateBookingStatus {
        booking_id: Ulid,
        actor: Actor,
        status: BookingStatus,
    },
    CancelBooking {
        booking_id: Ulid,
        actor: Actor,
    },
    RescheduleBooking {
        booking_id: Ulid,
        actor: Actor,
        date: NaiveDate,
        #[serde(with = "hhmm")]
        start_time: NaiveTime,
    },
    GetBooking {
        booking_id: Ulid,
    },
    ListBookings(BookingFilter),
}

impl Request {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Request::RegisterTrainer { .. } => "register_trainer",
            Request::RegisterClient { .. } => "register_client",
            Request::SetWeeklyAvailability(_) => "set_weekly_availability",
            Request::GetWeeklyAvailability { .. } => "get_weekly_availability",
            Request::SetCapacity { .. } => "set_capacity",
            Request::GetCapacity { .. } => "get_capacity",
            Request::SetPreferences { .. } => "set_preferences",
            Request::GetPreferences { .. } => "get_preferences",
            Request::AddBlockedInterval(_) => "add_blocked_interval",
            Request::RemoveBlockedInterval { .. } => "remove_blocked_interval",
            Request::ListBlockedIntervals { .. } => "list_blocked_intervals",
            Request::GetAvailableSlots { .. } => "get_available_slots",
            Request::RequestBooking(_) => "request_booking",
            Request::CreateBooking(_) => "create_booking",
            Request::UpdateBookingStatus { .. } => "update_booking_status",
            Request::CancelBooking { .. } => "cancel_booking",
            Request::RescheduleBooking { .. } => "reschedule_booking",
            Request::GetBooking { .. } => "get_booking",
            Request::ListBookings(_) => "list_bookings",
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value, BookingError> {
    serde_json::to_value(value).map_err(|e| BookingError::Storage(format!("encode response: {e}")))
}

async fn dispatch(engine: &Engine, request: Request) -> Result<Value, BookingError> {
    match request {
        Request::RegisterTrainer { id, name } => {
            engine.register_trainer(id, name).await?;
            Ok(json!({ "id": id }))
        }
        Request::RegisterClient { id, name } => {
            engine.register_client(id, name).await?;
            Ok(json!({ "id": id }))
        }
        Request::SetWeeklyAvailability(row) => {
            engine.set_weekly_availability(row).await?;
            to_value(row)
        }
        Request::GetWeeklyAvailability { trainer_id } => {
            to_value(engine.get_weekly_availability(trainer_id).await?)
        }
        Request::SetCapacity { trainer_id, settings } => {
            engine.set_capacity(trainer_id, settings).await?;
            to_value(settings)
        }
        Request::GetCapacity { trainer_id } => to_value(engine.get_capacity(trainer_id).await?),
        Request::SetPreferences {
            trainer_id,
            preferences,
        } => {
            engine.set_preferences(trainer_id, preferences).await?;
            to_value(preferences)
        }
        Request::GetPreferences { trainer_id } => to_value(engine.get_preferences(trainer_id).await?),
        Request::AddBlockedInterval(block) => {
            engine.add_blocked_interval(block.clone()).await?;
            to_value(block)
        }
        Request::RemoveBlockedInterval { id } => to_value(engine.remove_blocked_interval(id).await?),
        Request::ListBlockedIntervals { trainer_id } => {
            to_value(engine.list_blocked_intervals(trainer_id).await?)
        }
        Request::GetAvailableSlots {
            trainer_id,
            start_date,
            end_date,
            duration_minutes,
        } => to_value(
            engine
                .get_available_slots(trainer_id, start_date, end_date, duration_minutes)
                .await?,
        ),
        Request::RequestBooking(req) => to_value(engine.request_booking(req).await?),
        Request::CreateBooking(req) => to_value(engine.create_booking(req).await?),
        Request::UpdateBookingStatus {
            booking_id,
            actor,
            status,
        } => to_value(engine.update_booking_status(booking_id, actor, status).await?),
        Request::CancelBooking { booking_id, actor } => {
            to_value(engine.cancel_booking(booking_id, actor).await?)
        }
        Request::RescheduleBooking {
            booking_id,
            actor,
            date,
            start_time,
        } => to_value(
            engine
                .reschedule_booking(booking_id, actor, date, start_time)
                .await?,
        ),
        Request::GetBooking { booking_id } => to_value(engine.get_booking(booking_id).await?),
        Request::ListBookings(filter) => to_value(engine.list_bookings(&filter).await?),
    }
}

pub fn error_body(err: &BookingError) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": err.code(),
            "message": err.to_string(),
            "details": err.details(),
        }
    })
}

/// Parse and execute one request line.
pub async fn handle_line(engine: &Engine, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return error_body(&BookingError::validation("request", e.to_string()));
        }
    };

    let op = request.label();
    let started = Instant::now();
    let result = dispatch(engine, request).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        observability::REQUESTS_TOTAL,
        "op" => op,
        "status" => observability::status_label(&result)
    )
    .increment(1);

    match result {
        Ok(value) => json!({ "ok": true, "result": value }),
        Err(e) => {
            debug!(op, code = e.code(), "request failed: {e}");
            error_body(&e)
        }
    }
}

/// Serve one connection until the peer hangs up.
pub async fn process_connection<S>(stream: S, engine: Arc<Engine>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    // After a decode error the stream yields one `None` before resuming.
    let mut recovering = false;
    loop {
        let frame = match framed.next().await {
            Some(frame) => frame,
            None if recovering => {
                recovering = false;
                continue;
            }
            None => break,
        };
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request line exceeds {MAX_LINE_LEN} bytes");
                recovering = true;
                error_body(&BookingError::LimitExceeded("request line too long"))
            }
            Err(e) => return Err(e),
        };
        framed.send(response.to_string()).await?;
    }
    Ok(())
}
