use ulid::Ulid;

use crate::model::{ConflictingBooking, Role, Status};
use crate::store::StoreError;

/// Why a proposed window was rejected. User-correctable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    TooSoon,
    InvalidOrder,
    TooShort,
    TooLong,
}

impl WindowError {
    pub fn code(self) -> &'static str {
        match self {
            WindowError::TooSoon => "too_soon",
            WindowError::InvalidOrder => "invalid_order",
            WindowError::TooShort => "too_short",
            WindowError::TooLong => "too_long",
        }
    }
}

impl std::fmt::Display for WindowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowError::TooSoon => write!(f, "bookings must start at least 2 hours from now"),
            WindowError::InvalidOrder => write!(f, "end time must be after start time"),
            WindowError::TooShort => write!(f, "bookings must last at least 1 hour"),
            WindowError::TooLong => write!(f, "bookings may last at most 8 hours"),
        }
    }
}

impl std::error::Error for WindowError {}

#[derive(Debug)]
pub enum EngineError {
    Validation(WindowError),
    /// The window collides with these active bookings.
    Conflict(Vec<ConflictingBooking>),
    /// Transition not in the table for this role, or the booking moved on
    /// since the caller last read it.
    InvalidTransition {
        id: Ulid,
        from: Status,
        to: Status,
        role: Role,
    },
    NotFound(Ulid),
    NotParticipant {
        id: Ulid,
        actor: Ulid,
    },
    SelfBooking(Ulid),
    NotYetElapsed(Ulid),
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl EngineError {
    /// Stable machine-readable code for the wire layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(w) => w.code(),
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotFound(_) => "not_found",
            EngineError::NotParticipant { .. } => "not_participant",
            EngineError::SelfBooking(_) => "self_booking",
            EngineError::NotYetElapsed(_) => "not_yet_elapsed",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(e) if e.is_retryable() => "store_retryable",
            EngineError::Store(_) => "store_fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_retryable())
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(w) => write!(f, "{w}"),
            EngineError::Conflict(hits) => {
                write!(f, "requested time conflicts with existing booking(s):")?;
                for h in hits {
                    write!(f, " {} {} ({})", h.id, h.span, h.status)?;
                }
                Ok(())
            }
            EngineError::InvalidTransition { id, from, to, role } => write!(
                f,
                "this booking has already been updated or the transition is not allowed ({id}: {role} cannot move {from} -> {to})"
            ),
            EngineError::NotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::NotParticipant { id, actor } => {
                write!(f, "{actor} is not a party to booking {id}")
            }
            EngineError::SelfBooking(id) => write!(f, "{id} cannot book themselves"),
            EngineError::NotYetElapsed(id) => write!(f, "booking {id} has not ended yet"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Validation(w) => Some(w),
            EngineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WindowError> for EngineError {
    fn from(e: WindowError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Overlap(hits) => EngineError::Conflict(hits),
            other => EngineError::Store(other),
        }
    }
}
