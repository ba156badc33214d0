use crate::model::*;

/// Outcome of testing a candidate window against a provider's calendar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    /// Colliding active bookings, sorted by start.
    pub colliding: Vec<ConflictingBooking>,
}

impl ConflictReport {
    pub fn has_conflict(&self) -> bool {
        !self.colliding.is_empty()
    }
}

/// Test `candidate` against `existing` bookings under half-open semantics.
///
/// Only active (pending/confirmed) bookings count; terminal ones are skipped
/// even if the caller passes them in. Adjacent windows do not conflict.
pub fn detect_conflicts(candidate: &Span, existing: &[Booking]) -> ConflictReport {
    let mut colliding: Vec<ConflictingBooking> = existing
        .iter()
        .filter(|b| b.status.is_active())
        .filter(|b| b.span.start < candidate.end && b.span.end > candidate.start)
        .map(ConflictingBooking::from)
        .collect();
    colliding.sort_by_key(|c| (c.span.start, c.id));
    ConflictReport { colliding }
}
