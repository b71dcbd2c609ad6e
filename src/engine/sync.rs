use std::future::Future;

use tracing::warn;

use crate::calendar::SyncError;
use crate::model::*;
use crate::observability;

use super::{BookingError, Engine, EntityKind};

impl Engine {
    /// Run one calendar call under the sync timeout, turning any failure into a warning.
    async fn guarded<T>(
        &self,
        booking_id: ulid::Ulid,
        operation: SyncOperation,
        call: impl Future<Output = Result<T, SyncError>>,
    ) -> Result<T, SyncWarning> {
        let message = match tokio::time::timeout(self.sync_timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("calendar sync timed out after {:?}", self.sync_timeout),
        };
        let op = match operation {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        };
        metrics::counter!(observability::SYNC_FAILURES_TOTAL, "operation" => op).increment(1);
        warn!(%booking_id, operation = op, "{message}");
        Err(SyncWarning {
            booking_id,
            operation,
            message,
        })
    }

    /// Mirror a newly confirmed booking. A returned external reference is
    /// persisted on the booking.
    pub(super) async fn sync_created(&self, outcome: &mut BookingOutcome) {
        let id = outcome.booking.id;
        let created = self
            .guarded(id, SyncOperation::Create, self.calendar.create(&outcome.booking))
            .await;
        let external_ref = match created {
            Ok(Some(external_ref)) => external_ref,
            Ok(None) => return,
            Err(warning) => {
                outcome.warnings.push(warning);
                return;
            }
        };
        let stored = match self.record_sync_ref(&outcome.booking, Some(external_ref.clone())).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(booking_id = %id, "failed to record calendar reference: {e}");
                outcome.warnings.push(SyncWarning {
                    booking_id: id,
                    operation: SyncOperation::Create,
                    message: e.to_string(),
                });
                return;
            }
        };
        outcome.booking.external_sync_ref = Some(external_ref);

        // A cancel or reschedule that committed while the create was in flight
        // saw no reference and skipped its own calendar call.
        let follow_up = if stored.status == BookingStatus::Cancelled {
            Some(
                self.guarded(id, SyncOperation::Delete, self.calendar.delete(&stored))
                    .await,
            )
        } else if (stored.date, stored.start_time, stored.end_time)
            != (outcome.booking.date, outcome.booking.start_time, outcome.booking.end_time)
        {
            Some(
                self.guarded(id, SyncOperation::Update, self.calendar.update(&stored))
                    .await,
            )
        } else {
            None
        };
        if let Some(Err(warning)) = follow_up {
            outcome.warnings.push(warning);
        }
    }

    pub(super) async fn sync_updated(&self, outcome: &mut BookingOutcome) {
        let result = self
            .guarded(outcome.booking.id, SyncOperation::Update, self.calendar.update(&outcome.booking))
            .await;
        if let Err(warning) = result {
            outcome.warnings.push(warning);
        }
    }

    pub(super) async fn sync_deleted(&self, outcome: &mut BookingOutcome) {
        let result = self
            .guarded(outcome.booking.id, SyncOperation::Delete, self.calendar.delete(&outcome.booking))
            .await;
        if let Err(warning) = result {
            outcome.warnings.push(warning);
        }
    }

    /// Durable follow-up event; only the trainer lock is needed since the
    /// reference does not affect any client ledger. Returns the booking as
    /// stored, which may have moved on since the calendar call started.
    async fn record_sync_ref(
        &self,
        booking: &Booking,
        external_ref: Option<String>,
    ) -> Result<Booking, BookingError> {
        let _gate = self.write_gate.read().await;
        let trainer = self.require_trainer(booking.trainer_id)?;
        let mut ts = trainer.write().await;
        let event = Event::BookingSyncRefSet {
            id: booking.id,
            trainer_id: booking.trainer_id,
            external_ref,
        };
        self.commit(&mut ts, None, &event).await?;
        ts.booking(&booking.id)
            .cloned()
            .ok_or_else(|| BookingError::not_found(EntityKind::Booking, booking.id))
    }
}
