use crate::limits::*;
use crate::model::*;

use super::error::WindowError;

/// Check a proposed `[start, end)` against lead-time and duration policy.
///
/// Causes are checked in a fixed order and the first failure wins:
/// TooSoon, InvalidOrder, TooShort, TooLong.
pub fn validate_window(start: Ms, end: Ms, now: Ms) -> Result<Span, WindowError> {
    if start <= now.saturating_add(LEAD_TIME_MS) {
        return Err(WindowError::TooSoon);
    }
    if end <= start {
        return Err(WindowError::InvalidOrder);
    }
    let duration = end - start;
    if duration < MIN_BOOKING_MS {
        return Err(WindowError::TooShort);
    }
    if duration > MAX_BOOKING_MS {
        return Err(WindowError::TooLong);
    }
    Ok(Span::new(start, end))
}
