/// Longest date range a single slot query may cover (inclusive day count).
pub const MAX_QUERY_DAYS: i64 = 90;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_SESSION_TYPE_LEN: usize = 64;
pub const MAX_TIMEZONE_LEN: usize = 64;
pub const MAX_REASON_LEN: usize = 500;

pub const MAX_BLOCKS_PER_TRAINER: usize = 10_000;
pub const MAX_BOOKINGS_PER_TRAINER: usize = 200_000;

pub const MIN_SESSION_MINUTES: u32 = 5;
pub const MAX_SESSION_MINUTES: u32 = 480;
pub const MAX_BREAK_MINUTES: u32 = 240;
pub const MAX_ADVANCE_BOOKING_DAYS: u32 = 365;
pub const MAX_CANCELLATION_HOURS: u32 = 720;

/// Longest request line accepted by the wire protocol.
pub const MAX_LINE_LEN: usize = 64 * 1024;
