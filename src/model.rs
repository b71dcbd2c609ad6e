use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight, trainer-local wall clock.
pub type Minute = i32;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_times(start: NaiveTime, end: NaiveTime) -> Self {
        Self::new(minute_of(start), minute_of(end))
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    /// `NOT(self.end <= other.start OR self.start >= other.end)`
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn start_time(&self) -> NaiveTime {
        time_of(self.start)
    }

    pub fn end_time(&self) -> NaiveTime {
        time_of(self.end)
    }
}

pub fn minute_of(t: NaiveTime) -> Minute {
    (t.hour() * 60 + t.minute()) as Minute
}

/// Inverse of [`minute_of`]. Callers keep `m` inside `[0, MINUTES_PER_DAY)`.
pub fn time_of(m: Minute) -> NaiveTime {
    debug_assert!((0..MINUTES_PER_DAY).contains(&m), "minute {m} outside a day");
    NaiveTime::MIN + Duration::minutes(i64::from(m))
}

/// Day index with Sunday = 0 through Saturday = 6.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Parse `HH:MM` (seconds tolerated and dropped).
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    let t = NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))?;
    let t = t.with_second(0).unwrap_or(t);
    Ok(t.with_nanosecond(0).unwrap_or(t))
}

/// Serde adapter: `NaiveTime` as `"HH:MM"`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_hhmm(&s).map_err(|e| serde::de::Error::custom(format!("{s:?}: {e}")))
    }

    pub mod option {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_some(&t.format("%H:%M").to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(s) => crate::model::parse_hhmm(&s)
                    .map(Some)
                    .map_err(|e| serde::de::Error::custom(format!("{s:?}: {e}"))),
                None => Ok(None),
            }
        }
    }
}

// ── Trainer configuration ────────────────────────────────────────

/// One recurring availability window (morning or evening) of a weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub available: bool,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Window {
    pub fn span(&self) -> Option<Span> {
        (self.available && self.start < self.end).then(|| Span::from_times(self.start, self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyAvailability {
    pub trainer_id: Ulid,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub morning: Window,
    pub evening: Window,
}

impl WeeklyAvailability {
    /// Row used when the trainer never configured this weekday: both windows closed.
    pub fn default_for(trainer_id: Ulid, day_of_week: u8) -> Self {
        Self {
            trainer_id,
            day_of_week,
            morning: Window {
                available: false,
                start: hm(6, 0),
                end: hm(12, 0),
            },
            evening: Window {
                available: false,
                start: hm(16, 0),
                end: hm(21, 0),
            },
        }
    }

    /// Open windows in morning-then-evening order.
    pub fn windows(&self) -> impl Iterator<Item = Span> {
        [self.morning.span(), self.evening.span()].into_iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySettings {
    pub max_daily_sessions: u32,
    pub max_weekly_sessions: u32,
    pub session_duration_minutes: u32,
    pub break_between_sessions_minutes: u32,
}

impl Default for CapacitySettings {
    fn default() -> Self {
        Self {
            max_daily_sessions: 8,
            max_weekly_sessions: 56,
            session_duration_minutes: 60,
            break_between_sessions_minutes: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPreferences {
    pub allow_self_booking: bool,
    pub require_approval: bool,
    pub advance_booking_days: u32,
    pub cancellation_hours: u32,
    pub allow_weekend_booking: bool,
    #[serde(with = "hhmm")]
    pub earliest_booking_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub latest_booking_time: NaiveTime,
}

impl Default for BookingPreferences {
    fn default() -> Self {
        Self {
            allow_self_booking: true,
            require_approval: false,
            advance_booking_days: 30,
            cancellation_hours: 24,
            allow_weekend_booking: true,
            earliest_booking_time: hm(6, 0),
            latest_booking_time: hm(21, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub kind: RecurrenceKind,
    /// Last date (inclusive) the block repeats on. `None` repeats forever.
    pub until: Option<NaiveDate>,
}

/// A trainer-declared window during which nothing can be booked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInterval {
    #[serde(default = "Ulid::new")]
    pub id: Ulid,
    pub trainer_id: Ulid,
    /// First (or only) date the block applies to.
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub reason: Option<String>,
    pub recurrence: Option<Recurrence>,
}

impl BlockedInterval {
    pub fn span(&self) -> Span {
        Span::from_times(self.start_time, self.end_time)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub client_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub session_type: Option<String>,
    /// Carried for display only; every time here is trainer-local.
    pub timezone: Option<String>,
    pub external_sync_ref: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_times(self.start_time, self.end_time)
    }

    pub fn start_datetime(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Who is performing a workflow operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Trainer(Ulid),
    Client(Ulid),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Trainer(id) => write!(f, "trainer {id}"),
            Actor::Client(id) => write!(f, "client {id}"),
        }
    }
}

/// Input for both client requests and trainer-direct creation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    #[serde(default = "Ulid::new")]
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub client_id: Ulid,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    /// Trainer-direct creation only; otherwise the session length applies.
    #[serde(default, with = "hhmm::option")]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub session_type: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl BookingRequest {
    pub fn new(trainer_id: Ulid, client_id: Ulid, date: NaiveDate, start_time: NaiveTime) -> Self {
        Self {
            id: Ulid::new(),
            trainer_id,
            client_id,
            date,
            start_time,
            end_time: None,
            notes: None,
            session_type: None,
            timezone: None,
        }
    }
}

// ── Slot generation output ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub duration_minutes: u32,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::from_times(self.start_time, self.end_time)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySlots {
    pub day_name: String,
    pub slots: Vec<Slot>,
    pub remaining_capacity: u32,
    pub remaining_weekly_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotReport {
    pub trainer_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub session_duration_minutes: u32,
    pub break_between_sessions_minutes: u32,
    pub max_daily_sessions: u32,
    pub max_weekly_sessions: u32,
    pub days: BTreeMap<NaiveDate, DaySlots>,
}

// ── In-memory state ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Indexed by day-of-week (Sunday = 0). `None` means never configured.
    pub availability: [Option<WeeklyAvailability>; 7],
    pub capacity: Option<CapacitySettings>,
    pub preferences: Option<BookingPreferences>,
    pub blocks: Vec<BlockedInterval>,
    /// Every booking ever made, per date, sorted by `start_time`.
    pub bookings: BTreeMap<NaiveDate, Vec<Booking>>,
    booking_dates: HashMap<Ulid, NaiveDate>,
}

impl TrainerState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            availability: [None; 7],
            capacity: None,
            preferences: None,
            blocks: Vec::new(),
            bookings: BTreeMap::new(),
            booking_dates: HashMap::new(),
        }
    }

    pub fn availability_for(&self, date: NaiveDate) -> WeeklyAvailability {
        self.availability_on_day(day_of_week(date))
    }

    pub fn availability_on_day(&self, day: u8) -> WeeklyAvailability {
        self.availability
            .get(day as usize)
            .copied()
            .flatten()
            .unwrap_or_else(|| WeeklyAvailability::default_for(self.id, day))
    }

    pub fn capacity(&self) -> CapacitySettings {
        self.capacity.unwrap_or_default()
    }

    pub fn preferences(&self) -> BookingPreferences {
        self.preferences.unwrap_or_default()
    }

    /// Insert booking maintaining per-date sort order by start time.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.bookings.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.start_time, |b| b.start_time)
            .unwrap_or_else(|e| e);
        self.booking_dates.insert(booking.id, booking.date);
        day.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let date = self.booking_dates.remove(&id)?;
        let day = self.bookings.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.bookings.remove(&date);
        }
        Some(removed)
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        let date = self.booking_dates.get(id)?;
        self.bookings.get(date)?.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        let date = self.booking_dates.get(id)?;
        self.bookings.get_mut(date)?.iter_mut().find(|b| b.id == *id)
    }

    pub fn booking_count(&self) -> usize {
        self.booking_dates.len()
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.bookings
            .get(&date)
            .into_iter()
            .flatten()
            .filter(|b| b.is_active())
    }

    /// Active bookings on `date` whose interval overlaps `query`.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: Span) -> impl Iterator<Item = &Booking> {
        let day: &[Booking] = self.bookings.get(&date).map(Vec::as_slice).unwrap_or_default();
        let right_bound = day.partition_point(|b| minute_of(b.start_time) < query.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.is_active() && minute_of(b.end_time) > query.start)
    }

    /// Active bookings in the inclusive date range.
    pub fn active_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.bookings
            .range(from..=to)
            .flat_map(|(_, day)| day.iter())
            .filter(|b| b.is_active())
    }
}

/// Bookings a client holds across all trainers, used for client double-booking checks.
#[derive(Debug, Clone)]
pub struct ClientLedger {
    pub id: Ulid,
    pub name: Option<String>,
    /// Active bookings only.
    pub bookings: Vec<ClientBooking>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientBooking {
    pub booking_id: Ulid,
    pub trainer_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl ClientLedger {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            bookings: Vec::new(),
        }
    }

    pub fn upsert(&mut self, entry: ClientBooking) {
        match self.bookings.iter_mut().find(|b| b.booking_id == entry.booking_id) {
            Some(existing) => *existing = entry,
            None => self.bookings.push(entry),
        }
    }

    pub fn remove(&mut self, booking_id: Ulid) {
        self.bookings.retain(|b| b.booking_id != booking_id);
    }

    pub fn overlapping(&self, date: NaiveDate, span: Span) -> impl Iterator<Item = &ClientBooking> {
        self.bookings
            .iter()
            .filter(move |b| b.date == date && b.span.overlaps(&span))
    }
}

/// WAL record format. Flat events, one per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TrainerRegistered {
        id: Ulid,
        name: Option<String>,
    },
    ClientRegistered {
        id: Ulid,
        name: Option<String>,
    },
    AvailabilitySet {
        trainer_id: Ulid,
        availability: WeeklyAvailability,
    },
    CapacitySet {
        trainer_id: Ulid,
        settings: CapacitySettings,
    },
    PreferencesSet {
        trainer_id: Ulid,
        preferences: BookingPreferences,
    },
    BlockAdded {
        block: BlockedInterval,
    },
    BlockRemoved {
        id: Ulid,
        trainer_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        trainer_id: Ulid,
        client_id: Ulid,
        status: BookingStatus,
        at: NaiveDateTime,
    },
    BookingRescheduled {
        id: Ulid,
        trainer_id: Ulid,
        client_id: Ulid,
        date: NaiveDate,
        #[serde(with = "hhmm")]
        start_time: NaiveTime,
        #[serde(with = "hhmm")]
        end_time: NaiveTime,
        at: NaiveDateTime,
    },
    BookingSyncRefSet {
        id: Ulid,
        trainer_id: Ulid,
        external_ref: Option<String>,
    },
}

impl Event {
    /// Trainer whose state this event mutates (registrations excluded).
    pub fn trainer_id(&self) -> Option<Ulid> {
        match self {
            Event::AvailabilitySet { trainer_id, .. }
            | Event::CapacitySet { trainer_id, .. }
            | Event::PreferencesSet { trainer_id, .. }
            | Event::BlockRemoved { trainer_id, .. }
            | Event::BookingStatusChanged { trainer_id, .. }
            | Event::BookingRescheduled { trainer_id, .. }
            | Event::BookingSyncRefSet { trainer_id, .. } => Some(*trainer_id),
            Event::BlockAdded { block } => Some(block.trainer_id),
            Event::BookingCreated { booking } => Some(booking.trainer_id),
            Event::TrainerRegistered { .. } | Event::ClientRegistered { .. } => None,
        }
    }

    /// Client whose ledger this event mutates.
    pub fn client_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.client_id),
            Event::BookingStatusChanged { client_id, .. } | Event::BookingRescheduled { client_id, .. } => {
                Some(*client_id)
            }
            _ => None,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

/// Typed booking filter. At least one of `trainer_id` / `client_id` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BookingFilter {
    #[serde(default)]
    pub trainer_id: Option<Ulid>,
    #[serde(default)]
    pub client_id: Option<Ulid>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
}

impl BookingFilter {
    pub fn for_trainer(trainer_id: Ulid) -> Self {
        Self {
            trainer_id: Some(trainer_id),
            ..Self::default()
        }
    }

    pub fn for_client(client_id: Ulid) -> Self {
        Self {
            client_id: Some(client_id),
            ..Self::default()
        }
    }

    pub fn date_range(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, b: &Booking) -> bool {
        self.trainer_id.is_none_or(|t| b.trainer_id == t)
            && self.client_id.is_none_or(|c| b.client_id == c)
            && self.from.is_none_or(|d| b.date >= d)
            && self.to.is_none_or(|d| b.date <= d)
            && self.status.is_none_or(|s| b.status == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Non-fatal calendar sync failure attached to an otherwise successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncWarning {
    pub booking_id: Ulid,
    pub operation: SyncOperation,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingOutcome {
    pub booking: Booking,
    pub warnings: Vec<SyncWarning>,
}

impl BookingOutcome {
    pub fn new(booking: Booking) -> Self {
        Self {
            booking,
            warnings: Vec::new(),
        }
    }
}

pub(crate) fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::MIN + Duration::minutes(i64::from(h * 60 + m))
}
