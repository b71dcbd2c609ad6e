use async_trait::async_trait;
use thiserror::Error;

use crate::model::Booking;

#[derive(Debug, Error)]
#[error("calendar sync failed: {0}")]
pub struct SyncError(pub String);

/// External calendar that mirrors confirmed bookings. Every call is best-effort:
/// the engine turns failures into warnings and never rolls back a booking.
#[async_trait]
pub trait CalendarSync: Send + Sync {
    /// Create the external event; returns its reference when the calendar assigns one.
    async fn create(&self, booking: &Booking) -> Result<Option<String>, SyncError>;

    async fn update(&self, booking: &Booking) -> Result<(), SyncError>;

    async fn delete(&self, booking: &Booking) -> Result<(), SyncError>;
}

/// Used when no calendar is connected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCalendar;

#[async_trait]
impl CalendarSync for NoopCalendar {
    async fn create(&self, booking: &Booking) -> Result<Option<String>, SyncError> {
        tracing::debug!(booking_id = %booking.id, "calendar sync disabled, skipping create");
        Ok(None)
    }

    async fn update(&self, booking: &Booking) -> Result<(), SyncError> {
        tracing::debug!(booking_id = %booking.id, "calendar sync disabled, skipping update");
        Ok(())
    }

    async fn delete(&self, booking: &Booking) -> Result<(), SyncError> {
        tracing::debug!(booking_id = %booking.id, "calendar sync disabled, skipping delete");
        Ok(())
    }
}
