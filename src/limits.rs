use crate::model::Ms;

const MINUTE_MS: Ms = 60_000;
const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Minimum gap between "now" and a booking's start.
pub const LEAD_TIME_MS: Ms = 2 * HOUR_MS;
pub const MIN_BOOKING_MS: Ms = HOUR_MS;
pub const MAX_BOOKING_MS: Ms = 8 * HOUR_MS;

/// Counted in chars, not bytes.
pub const MAX_MESSAGE_LEN: usize = 500;

/// 2000-01-01T00:00:00Z .. 2100-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 16 * 1024;
/// Max parties one connection may LISTEN on.
pub const MAX_SUBSCRIPTIONS_PER_CONN: usize = 64;
