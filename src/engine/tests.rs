use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use super::*;
use crate::calendar::{CalendarSync, NoopCalendar, SyncError};
use crate::clock::FixedClock;
use crate::model::*;

// ── Fixtures ─────────────────────────────────────────────

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn at(s: &str) -> NaiveDateTime {
    s.parse().unwrap()
}

/// Friday noon.
const NOW: &str = "2024-05-31T12:00:00";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spotter_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Calendar double that records every call and can fail or stall on demand.
#[derive(Default)]
struct RecordingCalendar {
    calls: std::sync::Mutex<Vec<(SyncOperation, Ulid)>>,
    fail: bool,
    delay: Option<StdDuration>,
}

impl RecordingCalendar {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn stalling(delay: StdDuration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(SyncOperation, Ulid)> {
        self.calls.lock().unwrap().clone()
    }

    async fn record(&self, op: SyncOperation, id: Ulid) -> Result<(), SyncError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push((op, id));
        if self.fail {
            return Err(SyncError("calendar unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarSync for RecordingCalendar {
    async fn create(&self, booking: &Booking) -> Result<Option<String>, SyncError> {
        self.record(SyncOperation::Create, booking.id).await?;
        Ok(Some(format!("evt-{}", booking.id)))
    }

    async fn update(&self, booking: &Booking) -> Result<(), SyncError> {
        self.record(SyncOperation::Update, booking.id).await
    }

    async fn delete(&self, booking: &Booking) -> Result<(), SyncError> {
        self.record(SyncOperation::Delete, booking.id).await
    }
}

struct Harness {
    engine: Arc<Engine>,
    clock: FixedClock,
    calendar: Arc<RecordingCalendar>,
    path: PathBuf,
}

impl Harness {
    fn new(name: &str) -> Self {
        Self::with_calendar(name, RecordingCalendar::default())
    }

    fn with_calendar(name: &str, calendar: RecordingCalendar) -> Self {
        let path = test_wal_path(name);
        let clock = FixedClock::new(at(NOW));
        let calendar = Arc::new(calendar);
        let engine = Engine::new(path.clone(), calendar.clone(), Arc::new(clock.clone())).unwrap();
        Self {
            engine: Arc::new(engine),
            clock,
            calendar,
            path,
        }
    }

    /// A second engine over the same WAL, as after a restart.
    fn reopen(&self) -> Engine {
        Engine::new(
            self.path.clone(),
            Arc::new(NoopCalendar),
            Arc::new(self.clock.clone()),
        )
        .unwrap()
    }

    async fn trainer(&self) -> Ulid {
        let id = Ulid::new();
        self.engine
            .register_trainer(id, Some("Dana".into()))
            .await
            .unwrap();
        id
    }

    async fn client(&self) -> Ulid {
        let id = Ulid::new();
        self.engine.register_client(id, None).await.unwrap();
        id
    }

    async fn capacity(&self, trainer_id: Ulid, daily: u32, weekly: u32, duration: u32, gap: u32) {
        self.engine
            .set_capacity(
                trainer_id,
                CapacitySettings {
                    max_daily_sessions: daily,
                    max_weekly_sessions: weekly,
                    session_duration_minutes: duration,
                    break_between_sessions_minutes: gap,
                },
            )
            .await
            .unwrap();
    }

    async fn open_day(&self, trainer_id: Ulid, day_of_week: u8, morning: (u32, u32), evening: Option<(u32, u32)>) {
        let mut row = WeeklyAvailability::default_for(trainer_id, day_of_week);
        row.morning = Window {
            available: true,
            start: hm(morning.0, 0),
            end: hm(morning.1, 0),
        };
        if let Some((start, end)) = evening {
            row.evening = Window {
                available: true,
                start: hm(start, 0),
                end: hm(end, 0),
            };
        }
        self.engine.set_weekly_availability(row).await.unwrap();
    }

    async fn request(&self, trainer_id: Ulid, client_id: Ulid, day: &str, h: u32, m: u32) -> Result<BookingOutcome, BookingError> {
        self.engine
            .request_booking(BookingRequest::new(trainer_id, client_id, date(day), hm(h, m)))
            .await
    }
}

// ── Registration & settings ──────────────────────────────

#[tokio::test]
async fn unconfigured_trainer_reads_defaults() {
    let h = Harness::new("defaults.wal");
    let t = h.trainer().await;

    assert_eq!(h.engine.get_capacity(t).await.unwrap(), CapacitySettings::default());
    assert_eq!(h.engine.get_preferences(t).await.unwrap(), BookingPreferences::default());
    let week = h.engine.get_weekly_availability(t).await.unwrap();
    assert_eq!(week.len(), 7);
    assert!(week.iter().all(|row| !row.morning.available && !row.evening.available));
    assert_eq!(week[0].day_of_week, 0);
    assert_eq!(week[0].morning.start, hm(6, 0));
    assert_eq!(week[0].evening.end, hm(21, 0));

    // Reading defaults does not persist anything.
    assert_eq!(h.engine.wal_appends_since_compact().await, 1);
}

#[tokio::test]
async fn duplicate_and_unknown_entities() {
    let h = Harness::new("duplicates.wal");
    let t = h.trainer().await;
    let err = h.engine.register_trainer(t, None).await.unwrap_err();
    assert!(matches!(err, BookingError::AlreadyExists { kind: EntityKind::Trainer, .. }));

    let err = h.engine.get_capacity(Ulid::new()).await.unwrap_err();
    assert_eq!(err.code(), "not_found");

    let c = h.client().await;
    let err = h.request(t, Ulid::new(), "2024-06-03", 10, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound { kind: EntityKind::Client, .. }));
    let err = h.request(Ulid::new(), c, "2024-06-03", 10, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound { kind: EntityKind::Trainer, .. }));
}

#[tokio::test]
async fn capacity_write_enforces_weekly_floor() {
    let h = Harness::new("capacity_floor.wal");
    let t = h.trainer().await;
    let err = h
        .engine
        .set_capacity(
            t,
            CapacitySettings {
                max_daily_sessions: 4,
                max_weekly_sessions: 20,
                ..CapacitySettings::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation { field: "max_weekly_sessions", .. }));
    assert_eq!(h.engine.get_capacity(t).await.unwrap(), CapacitySettings::default());

    h.capacity(t, 4, 28, 50, 10).await;
    assert_eq!(h.engine.get_capacity(t).await.unwrap().max_weekly_sessions, 28);
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn slots_follow_availability_duration_and_break() {
    let h = Harness::new("slots_basic.wal");
    let t = h.trainer().await;
    h.capacity(t, 8, 56, 45, 10).await;
    // 2024-06-01 is a Saturday (day 6).
    h.open_day(t, 6, (6, 8), None).await;

    let report = h
        .engine
        .get_available_slots(t, date("2024-06-01"), date("2024-06-02"), None)
        .await
        .unwrap();
    assert_eq!(report.days.len(), 2);
    assert_eq!(report.session_duration_minutes, 45);
    assert_eq!(report.break_between_sessions_minutes, 10);

    let sat = &report.days[&date("2024-06-01")];
    assert_eq!(sat.day_name, "Saturday");
    let starts: Vec<_> = sat.slots.iter().map(|s| (s.start_time, s.end_time)).collect();
    assert_eq!(starts, vec![(hm(6, 0), hm(6, 45)), (hm(6, 55), hm(7, 40))]);
    assert_eq!(sat.remaining_capacity, 8);

    // Sunday is still closed.
    assert!(report.days[&date("2024-06-02")].slots.is_empty());
}

#[tokio::test]
async fn booked_interval_disappears_from_slots() {
    let h = Harness::new("slots_exclude_booking.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.capacity(t, 8, 56, 60, 0).await;
    h.open_day(t, 1, (8, 12), None).await; // Monday

    h.request(t, c, "2024-06-03", 9, 0).await.unwrap();

    let report = h
        .engine
        .get_available_slots(t, date("2024-06-03"), date("2024-06-03"), None)
        .await
        .unwrap();
    let day = &report.days[&date("2024-06-03")];
    let starts: Vec<_> = day.slots.iter().map(|s| s.start_time).collect();
    assert_eq!(starts, vec![hm(8, 0), hm(10, 0), hm(11, 0)]);
    assert_eq!(day.remaining_capacity, 7);
    assert_eq!(day.remaining_weekly_capacity, 55);
}

#[tokio::test]
async fn slot_range_validation() {
    let h = Harness::new("slots_range.wal");
    let t = h.trainer().await;

    let err = h
        .engine
        .get_available_slots(t, date("2024-06-10"), date("2024-06-01"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let err = h
        .engine
        .get_available_slots(t, date("2024-06-01"), date("2024-09-01"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Validation { field: "end_date", .. }));

    let err = h
        .engine
        .get_available_slots(t, date("2024-06-01"), date("2024-06-02"), Some(0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation_error");

    let err = h
        .engine
        .get_available_slots(Ulid::new(), date("2024-06-01"), date("2024-06-02"), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

// ── Booking requests ─────────────────────────────────────

#[tokio::test]
async fn daily_cap_blocks_requests_and_clears_slots() {
    let h = Harness::new("daily_cap.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.capacity(t, 2, 14, 60, 0).await;
    h.open_day(t, 6, (6, 12), None).await;

    h.request(t, c, "2024-06-01", 8, 0).await.unwrap();
    h.request(t, c, "2024-06-01", 10, 0).await.unwrap();
    let err = h.request(t, c, "2024-06-01", 11, 0).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Capacity { scope: CapacityScope::Daily, limit: 2, booked: 2 }
    ));

    let report = h
        .engine
        .get_available_slots(t, date("2024-06-01"), date("2024-06-01"), None)
        .await
        .unwrap();
    let day = &report.days[&date("2024-06-01")];
    assert!(day.slots.is_empty());
    assert_eq!(day.remaining_capacity, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_for_one_slot_have_one_winner() {
    let h = Harness::new("race.wal");
    let t = h.trainer().await;
    let mut clients = Vec::new();
    for _ in 0..16 {
        clients.push(h.client().await);
    }

    let mut handles = Vec::new();
    for c in clients {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .request_booking(BookingRequest::new(t, c, date("2024-06-03"), hm(15, 0)))
                .await
        }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(BookingError::Overlap { party: Party::Trainer, conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].start_time, hm(15, 0));
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(won, 1);

    let listed = h
        .engine
        .list_bookings(&BookingFilter::for_trainer(t))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_booking_id_commits_once() {
    let h = Harness::new("shared_booking_id.wal");
    for _ in 0..20 {
        let (t1, t2) = (h.trainer().await, h.trainer().await);
        let (c1, c2) = (h.client().await, h.client().await);
        let first = BookingRequest::new(t1, c1, date("2024-06-03"), hm(9, 0));
        let mut second = BookingRequest::new(t2, c2, date("2024-06-03"), hm(9, 0));
        second.id = first.id;
        let id = first.id;

        let handles = [first, second].map(|req| {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.request_booking(req).await })
        });
        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => winners.push(outcome.booking.trainer_id),
                Err(err) => assert!(
                    matches!(err, BookingError::AlreadyExists { kind: EntityKind::Booking, .. }),
                    "unexpected error: {err:?}"
                ),
            }
        }
        assert_eq!(winners.len(), 1);

        let winner = winners[0];
        let loser = if winner == t1 { t2 } else { t1 };
        assert_eq!(h.engine.get_booking(id).await.unwrap().trainer_id, winner);
        assert!(h.engine.list_bookings(&BookingFilter::for_trainer(loser)).await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_of_one_id_keep_the_first() {
    let h = Harness::new("shared_trainer_id.wal");
    let id = Ulid::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.register_trainer(id, Some(format!("trainer {i}"))).await
        }));
    }
    let mut registered = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => registered += 1,
            Err(err) => assert_eq!(err.code(), "already_exists"),
        }
    }
    assert_eq!(registered, 1);
    assert_eq!(h.engine.wal_appends_since_compact().await, 1);
    assert_eq!(h.reopen().trainers.len(), 1);
}

#[tokio::test]
async fn rejected_request_releases_its_booking_id() {
    let h = Harness::new("released_booking_id.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let mut req = BookingRequest::new(t, c, date("2024-06-03"), hm(23, 30));
    let err = h.engine.request_booking(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");

    req.start_time = hm(9, 0);
    let outcome = h.engine.request_booking(req).await.unwrap();
    assert_eq!(outcome.booking.start_time, hm(9, 0));
}

#[tokio::test]
async fn client_cannot_double_book_across_trainers() {
    let h = Harness::new("client_overlap.wal");
    let first = h.trainer().await;
    let second = h.trainer().await;
    let c = h.client().await;

    h.request(first, c, "2024-06-03", 15, 0).await.unwrap();
    let err = h.request(second, c, "2024-06-03", 15, 30).await.unwrap_err();
    match &err {
        BookingError::Overlap { party, conflicts } => {
            assert_eq!(*party, Party::Client);
            assert_eq!(conflicts[0].trainer_id, first);
        }
        other => panic!("expected client overlap, got {other:?}"),
    }
    assert_eq!(err.to_string(), "client already has a session at 15:00");

    // Back-to-back is fine.
    h.request(second, c, "2024-06-03", 16, 0).await.unwrap();
}

#[tokio::test]
async fn policy_gates_requests() {
    let h = Harness::new("policy_gate.wal");
    let t = h.trainer().await;
    let c = h.client().await;

    // Earlier today.
    let err = h.request(t, c, "2024-05-31", 9, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::InPast { .. })));

    // Beyond the 30-day window.
    let err = h.request(t, c, "2024-07-01", 9, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::BeyondAdvanceWindow { .. })));

    // Outside booking hours.
    let err = h.request(t, c, "2024-06-03", 5, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::OutsideBookingHours { .. })));

    h.engine
        .set_preferences(
            t,
            BookingPreferences {
                allow_weekend_booking: false,
                ..BookingPreferences::default()
            },
        )
        .await
        .unwrap();
    let err = h.request(t, c, "2024-06-01", 9, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::WeekendNotAllowed { .. })));
}

#[tokio::test]
async fn request_rules_on_end_time_and_midnight() {
    let h = Harness::new("request_shape.wal");
    let t = h.trainer().await;
    let c = h.client().await;

    let mut req = BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0));
    req.end_time = Some(hm(9, 30));
    let err = h.engine.request_booking(req.clone()).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation { field: "end_time", .. }));

    // The trainer may set an explicit end.
    let outcome = h.engine.create_booking(req).await.unwrap();
    assert_eq!(outcome.booking.end_time, hm(9, 30));

    h.engine
        .set_preferences(
            t,
            BookingPreferences {
                latest_booking_time: hm(23, 30),
                ..BookingPreferences::default()
            },
        )
        .await
        .unwrap();
    let err = h.request(t, c, "2024-06-03", 23, 30).await.unwrap_err();
    assert!(matches!(err, BookingError::Validation { .. }));
}

#[tokio::test]
async fn self_booking_disabled_still_allows_trainer_create() {
    let h = Harness::new("self_booking.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.engine
        .set_preferences(
            t,
            BookingPreferences {
                allow_self_booking: false,
                require_approval: true,
                ..BookingPreferences::default()
            },
        )
        .await
        .unwrap();

    let err = h.request(t, c, "2024-06-03", 9, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::SelfBookingDisabled)));

    let outcome = h
        .engine
        .create_booking(BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0)))
        .await
        .unwrap();
    assert_eq!(outcome.booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn recurring_block_rejects_until_removed() {
    let h = Harness::new("blocks.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let block = BlockedInterval {
        id: Ulid::new(),
        trainer_id: t,
        date: date("2024-06-03"),
        start_time: hm(12, 0),
        end_time: hm(13, 0),
        reason: Some("team meeting".into()),
        recurrence: Some(Recurrence {
            kind: RecurrenceKind::Weekly,
            until: None,
        }),
    };
    h.engine.add_blocked_interval(block.clone()).await.unwrap();
    assert_eq!(h.engine.list_blocked_intervals(t).await.unwrap(), vec![block.clone()]);

    let err = h.request(t, c, "2024-06-10", 12, 30).await.unwrap_err();
    match err {
        BookingError::Blocked { block_id, date: d, reason, .. } => {
            assert_eq!(block_id, block.id);
            assert_eq!(d, date("2024-06-10"));
            assert_eq!(reason.as_deref(), Some("team meeting"));
        }
        other => panic!("expected blocked, got {other:?}"),
    }
    // Tuesday is unaffected.
    h.request(t, c, "2024-06-11", 12, 30).await.unwrap();

    let removed = h.engine.remove_blocked_interval(block.id).await.unwrap();
    assert_eq!(removed, block);
    h.request(t, c, "2024-06-10", 12, 30).await.unwrap();

    let err = h.engine.remove_blocked_interval(block.id).await.unwrap_err();
    assert!(matches!(err, BookingError::NotFound { kind: EntityKind::BlockedInterval, .. }));
}

#[tokio::test]
async fn weekly_cap_counts_the_iso_week() {
    let h = Harness::new("weekly_cap.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.capacity(t, 3, 21, 60, 0).await;
    // Mon 06-03 through Wed 06-05, three sessions each.
    for day in ["2024-06-03", "2024-06-04", "2024-06-05"] {
        for hour in [8, 10, 12] {
            h.request(t, c, day, hour, 0).await.unwrap();
        }
    }
    h.capacity(t, 1, 7, 60, 0).await;

    let err = h.request(t, c, "2024-06-06", 8, 0).await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Capacity { scope: CapacityScope::Weekly, limit: 7, booked: 9 }
    ));
    // Sunday 06-09 closes the same ISO week.
    let err = h.request(t, c, "2024-06-09", 8, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Capacity { scope: CapacityScope::Weekly, .. }));
    // Sunday 06-02 belongs to the previous week, Monday 06-10 to the next.
    h.request(t, c, "2024-06-02", 8, 0).await.unwrap();
    h.request(t, c, "2024-06-10", 8, 0).await.unwrap();
}

// ── Workflow ─────────────────────────────────────────────

#[tokio::test]
async fn approval_flow() {
    let h = Harness::new("approval.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.engine
        .set_preferences(
            t,
            BookingPreferences {
                require_approval: true,
                ..BookingPreferences::default()
            },
        )
        .await
        .unwrap();

    let outcome = h.request(t, c, "2024-06-03", 9, 0).await.unwrap();
    let id = outcome.booking.id;
    assert_eq!(outcome.booking.status, BookingStatus::Pending);
    assert!(h.calendar.calls().is_empty());

    // Pending bookings still hold the slot.
    let other = h.client().await;
    let err = h.request(t, other, "2024-06-03", 9, 0).await.unwrap_err();
    assert_eq!(err.code(), "overlap_conflict");

    let err = h
        .engine
        .update_booking_status(id, Actor::Client(c), BookingStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Forbidden { .. }));

    let approved = h
        .engine
        .update_booking_status(id, Actor::Trainer(t), BookingStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(approved.booking.status, BookingStatus::Confirmed);
    assert!(approved.warnings.is_empty());
    assert_eq!(h.calendar.calls(), vec![(SyncOperation::Create, id)]);
    let expected_ref = format!("evt-{id}");
    assert_eq!(approved.booking.external_sync_ref.as_deref(), Some(expected_ref.as_str()));
    assert_eq!(
        h.engine.get_booking(id).await.unwrap().external_sync_ref.as_deref(),
        Some(expected_ref.as_str())
    );

    let err = h
        .engine
        .update_booking_status(id, Actor::Trainer(t), BookingStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BookingError::State { from: BookingStatus::Confirmed, to: BookingStatus::Confirmed }
    ));
}

#[tokio::test]
async fn cancellation_deadline() {
    let h = Harness::new("cancel_deadline.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let outcome = h.request(t, c, "2024-06-03", 10, 0).await.unwrap();
    let id = outcome.booking.id;

    h.clock.set(at("2024-06-02T11:00:00"));
    let err = h.engine.cancel_booking(id, Actor::Client(c)).await.unwrap_err();
    match err {
        BookingError::Policy(PolicyViolation::CancellationDeadlinePassed { deadline }) => {
            assert_eq!(deadline, at("2024-06-02T10:00:00"));
        }
        other => panic!("expected deadline violation, got {other:?}"),
    }
    // The trainer is held to the same deadline.
    let err = h.engine.cancel_booking(id, Actor::Trainer(t)).await.unwrap_err();
    assert_eq!(err.code(), "policy_violation");

    h.clock.set(at("2024-06-02T09:00:00"));
    let cancelled = h.engine.cancel_booking(id, Actor::Client(c)).await.unwrap();
    assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
    assert!(h.calendar.calls().contains(&(SyncOperation::Delete, id)));

    let err = h.engine.cancel_booking(id, Actor::Trainer(t)).await.unwrap_err();
    assert!(matches!(err, BookingError::State { from: BookingStatus::Cancelled, .. }));

    // The freed slot can be booked again.
    h.request(t, c, "2024-06-03", 10, 0).await.unwrap();
}

#[tokio::test]
async fn pending_booking_cancels_inside_deadline() {
    let h = Harness::new("cancel_pending.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.engine
        .set_preferences(
            t,
            BookingPreferences {
                require_approval: true,
                ..BookingPreferences::default()
            },
        )
        .await
        .unwrap();
    let id = h.request(t, c, "2024-06-01", 9, 0).await.unwrap().booking.id;

    h.clock.set(at("2024-06-01T08:30:00"));
    let outcome = h
        .engine
        .update_booking_status(id, Actor::Trainer(t), BookingStatus::Cancelled)
        .await
        .unwrap();
    assert_eq!(outcome.booking.status, BookingStatus::Cancelled);
    // Never synced, so nothing to delete.
    assert!(h.calendar.calls().is_empty());
}

#[tokio::test]
async fn only_parties_may_act_on_a_booking() {
    let h = Harness::new("forbidden.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let id = h.request(t, c, "2024-06-03", 9, 0).await.unwrap().booking.id;

    let err = h.engine.cancel_booking(id, Actor::Client(Ulid::new())).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");
    let err = h.engine.cancel_booking(id, Actor::Trainer(Ulid::new())).await.unwrap_err();
    assert_eq!(err.code(), "forbidden");
    let err = h.engine.cancel_booking(Ulid::new(), Actor::Client(c)).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[tokio::test]
async fn status_update_to_cancelled_is_trainer_only() {
    let h = Harness::new("status_cancel_trainer_only.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let id = h.request(t, c, "2024-06-03", 9, 0).await.unwrap().booking.id;

    let err = h
        .engine
        .update_booking_status(id, Actor::Client(c), BookingStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Forbidden { .. }));
    assert_eq!(h.engine.get_booking(id).await.unwrap().status, BookingStatus::Confirmed);

    // The client still cancels through the cancellation operation.
    let cancelled = h.engine.cancel_booking(id, Actor::Client(c)).await.unwrap();
    assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
}

#[tokio::test]
async fn reschedule_excludes_itself_and_syncs_update() {
    let h = Harness::new("reschedule.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    let other = h.client().await;
    let id = h.request(t, c, "2024-06-03", 10, 0).await.unwrap().booking.id;
    h.request(t, other, "2024-06-03", 12, 0).await.unwrap();

    // Overlaps only its own old interval.
    let moved = h
        .engine
        .reschedule_booking(id, Actor::Client(c), date("2024-06-03"), hm(10, 30))
        .await
        .unwrap();
    assert_eq!((moved.booking.start_time, moved.booking.end_time), (hm(10, 30), hm(11, 30)));
    assert_eq!(moved.booking.status, BookingStatus::Confirmed);
    assert!(h.calendar.calls().contains(&(SyncOperation::Update, id)));

    let err = h
        .engine
        .reschedule_booking(id, Actor::Trainer(t), date("2024-06-03"), hm(11, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Overlap { party: Party::Trainer, .. }));

    // Moving to another day frees the old slot.
    h.engine
        .reschedule_booking(id, Actor::Trainer(t), date("2024-06-04"), hm(10, 0))
        .await
        .unwrap();
    h.request(t, other, "2024-06-03", 10, 30).await.unwrap();

    h.engine.cancel_booking(id, Actor::Client(c)).await.unwrap();
    let err = h
        .engine
        .reschedule_booking(id, Actor::Client(c), date("2024-06-05"), hm(10, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "state_error");
}

#[tokio::test]
async fn calendar_failure_becomes_a_warning() {
    let h = Harness::with_calendar("sync_failure.wal", RecordingCalendar::failing());
    let t = h.trainer().await;
    let c = h.client().await;

    let outcome = h.request(t, c, "2024-06-03", 9, 0).await.unwrap();
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(outcome.warnings[0].operation, SyncOperation::Create);
    assert_eq!(outcome.warnings[0].booking_id, outcome.booking.id);
    assert!(outcome.booking.external_sync_ref.is_none());

    // The booking is committed regardless.
    let stored = h.engine.get_booking(outcome.booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn calendar_timeout_becomes_a_warning() {
    let path = test_wal_path("sync_timeout.wal");
    let calendar = Arc::new(RecordingCalendar::stalling(StdDuration::from_secs(5)));
    let engine = Engine::new(path, calendar, Arc::new(FixedClock::new(at(NOW))))
        .unwrap()
        .with_sync_timeout(StdDuration::from_millis(20));
    let t = Ulid::new();
    let c = Ulid::new();
    engine.register_trainer(t, None).await.unwrap();
    engine.register_client(c, None).await.unwrap();

    let outcome = engine
        .request_booking(BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0)))
        .await
        .unwrap();
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].message.contains("timed out"));
}

/// Wait until the booking is committed; its calendar create may still be running.
async fn wait_for_commit(engine: &Engine, id: Ulid) {
    while engine.get_booking(id).await.is_err() {
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn cancel_during_calendar_create_still_deletes_the_event() {
    let h = Harness::with_calendar(
        "sync_cancel_race.wal",
        RecordingCalendar::stalling(StdDuration::from_millis(200)),
    );
    let t = h.trainer().await;
    let c = h.client().await;
    let req = BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0));
    let id = req.id;
    let engine = h.engine.clone();
    let requested = tokio::spawn(async move { engine.request_booking(req).await });

    wait_for_commit(&h.engine, id).await;
    let cancelled = h.engine.cancel_booking(id, Actor::Client(c)).await.unwrap();
    assert!(cancelled.booking.external_sync_ref.is_none());

    let outcome = requested.await.unwrap().unwrap();
    assert!(outcome.warnings.is_empty());
    let stored = h.engine.get_booking(id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.external_sync_ref, Some(format!("evt-{id}")));
    assert_eq!(
        h.calendar.calls(),
        vec![(SyncOperation::Create, id), (SyncOperation::Delete, id)]
    );
}

#[tokio::test]
async fn reschedule_during_calendar_create_updates_the_event() {
    let h = Harness::with_calendar(
        "sync_reschedule_race.wal",
        RecordingCalendar::stalling(StdDuration::from_millis(200)),
    );
    let t = h.trainer().await;
    let c = h.client().await;
    let req = BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0));
    let id = req.id;
    let engine = h.engine.clone();
    let requested = tokio::spawn(async move { engine.request_booking(req).await });

    wait_for_commit(&h.engine, id).await;
    h.engine
        .reschedule_booking(id, Actor::Client(c), date("2024-06-04"), hm(11, 0))
        .await
        .unwrap();

    requested.await.unwrap().unwrap();
    assert_eq!(
        h.calendar.calls(),
        vec![(SyncOperation::Create, id), (SyncOperation::Update, id)]
    );
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_bookings_by_trainer_client_and_status() {
    let h = Harness::new("list_bookings.wal");
    let t1 = h.trainer().await;
    let t2 = h.trainer().await;
    let c = h.client().await;
    let other = h.client().await;

    let a = h.request(t1, c, "2024-06-04", 9, 0).await.unwrap().booking.id;
    let b = h.request(t2, c, "2024-06-03", 9, 0).await.unwrap().booking.id;
    let x = h.request(t1, other, "2024-06-03", 9, 0).await.unwrap().booking.id;
    h.engine.cancel_booking(x, Actor::Client(other)).await.unwrap();

    let by_client: Vec<_> = h
        .engine
        .list_bookings(&BookingFilter::for_client(c))
        .await
        .unwrap()
        .into_iter()
        .map(|bk| bk.id)
        .collect();
    assert_eq!(by_client, vec![b, a]);

    let by_trainer = h.engine.list_bookings(&BookingFilter::for_trainer(t1)).await.unwrap();
    assert_eq!(by_trainer.len(), 2);

    let cancelled = h
        .engine
        .list_bookings(&BookingFilter::for_trainer(t1).with_status(BookingStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, x);

    let ranged = h
        .engine
        .list_bookings(&BookingFilter::for_trainer(t1).date_range(date("2024-06-04"), date("2024-06-04")))
        .await
        .unwrap();
    assert_eq!(ranged.len(), 1);
    assert_eq!(ranged[0].id, a);

    let err = h.engine.list_bookings(&BookingFilter::default()).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let h = Harness::new("replay.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.capacity(t, 2, 14, 45, 5).await;
    h.open_day(t, 1, (8, 12), Some((17, 20))).await;
    let block = BlockedInterval {
        id: Ulid::new(),
        trainer_id: t,
        date: date("2024-06-04"),
        start_time: hm(8, 0),
        end_time: hm(9, 0),
        reason: None,
        recurrence: None,
    };
    h.engine.add_blocked_interval(block.clone()).await.unwrap();
    let kept = h.request(t, c, "2024-06-03", 8, 0).await.unwrap().booking;
    let moved = h.request(t, c, "2024-06-03", 10, 0).await.unwrap().booking;
    h.engine
        .reschedule_booking(moved.id, Actor::Client(c), date("2024-06-05"), hm(10, 0))
        .await
        .unwrap();

    let restarted = h.reopen();
    assert_eq!(restarted.get_capacity(t).await.unwrap().session_duration_minutes, 45);
    let monday = &restarted.get_weekly_availability(t).await.unwrap()[1];
    assert!(monday.morning.available && monday.evening.available);
    assert_eq!(restarted.list_blocked_intervals(t).await.unwrap(), vec![block]);

    let stored = restarted.get_booking(kept.id).await.unwrap();
    assert_eq!(stored.external_sync_ref, Some(format!("evt-{}", kept.id)));
    let stored = restarted.get_booking(moved.id).await.unwrap();
    assert_eq!(stored.date, date("2024-06-05"));
    assert_eq!(stored.end_time, hm(10, 45));

    // The client ledger is rebuilt: a second trainer cannot overlap.
    let t2 = Ulid::new();
    restarted.register_trainer(t2, None).await.unwrap();
    let err = restarted
        .request_booking(BookingRequest::new(t2, c, date("2024-06-03"), hm(8, 30)))
        .await
        .unwrap_err();
    assert!(matches!(err, BookingError::Overlap { party: Party::Client, .. }));
}

#[tokio::test]
async fn writes_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let h = Harness::new("torn_restart.wal");
    let t = h.trainer().await;
    {
        let mut wal = std::fs::OpenOptions::new().append(true).open(&h.path).unwrap();
        wal.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
    }

    let recovered = h.reopen();
    assert!(recovered.trainer(&t).is_some());
    let c = Ulid::new();
    recovered.register_client(c, None).await.unwrap();
    let id = recovered
        .request_booking(BookingRequest::new(t, c, date("2024-06-03"), hm(9, 0)))
        .await
        .unwrap()
        .booking
        .id;

    let restarted = h.reopen();
    assert!(restarted.client(&c).is_some());
    assert_eq!(restarted.get_booking(id).await.unwrap().status, BookingStatus::Confirmed);
    let err = restarted
        .request_booking(BookingRequest::new(t, c, date("2024-06-03"), hm(9, 30)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "overlap_conflict");
}

#[tokio::test]
async fn compaction_preserves_state() {
    let h = Harness::new("compaction.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    for daily in 1..=5 {
        h.capacity(t, daily, daily * 7, 60, 0).await;
    }
    let live = h.request(t, c, "2024-06-03", 9, 0).await.unwrap().booking.id;
    let gone = h.request(t, c, "2024-06-03", 11, 0).await.unwrap().booking.id;
    h.engine.cancel_booking(gone, Actor::Trainer(t)).await.unwrap();

    let before = std::fs::metadata(&h.path).unwrap().len();
    assert!(h.engine.wal_appends_since_compact().await > 0);
    h.engine.compact_wal().await.unwrap();
    assert_eq!(h.engine.wal_appends_since_compact().await, 0);
    assert!(std::fs::metadata(&h.path).unwrap().len() < before);

    // Writes after compaction land in the new log.
    let late = h.request(t, c, "2024-06-04", 9, 0).await.unwrap().booking.id;

    let restarted = h.reopen();
    assert_eq!(restarted.get_capacity(t).await.unwrap().max_daily_sessions, 5);
    assert_eq!(restarted.get_booking(live).await.unwrap().status, BookingStatus::Confirmed);
    assert_eq!(restarted.get_booking(gone).await.unwrap().status, BookingStatus::Cancelled);
    assert!(restarted.get_booking(late).await.is_ok());
}

#[tokio::test]
async fn group_commit_under_concurrent_registrations() {
    let h = Harness::new("group_commit.wal");
    let mut handles = Vec::new();
    for i in 0..20 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine.register_client(Ulid::new(), Some(format!("client {i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(h.engine.wal_appends_since_compact().await, 20);
    assert_eq!(h.reopen().clients.len(), 20);
}

#[tokio::test]
async fn stale_clock_cannot_book_in_the_past() {
    let h = Harness::new("clock_advance.wal");
    let t = h.trainer().await;
    let c = h.client().await;
    h.request(t, c, "2024-06-03", 9, 0).await.unwrap();
    h.clock.advance(Duration::days(3));
    let err = h.request(t, c, "2024-06-03", 10, 0).await.unwrap_err();
    assert!(matches!(err, BookingError::Policy(PolicyViolation::InPast { .. })));
}
