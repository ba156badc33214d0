//! Persistence contract consumed by the engine.
//!
//! The production deployment backs this with a relational store; `LocalStore`
//! is the in-process implementation used by the service binary and tests.

mod local;
mod wal;

pub use local::LocalStore;
pub use wal::Wal;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[async_trait]
pub trait BookingRepository: Send + Sync {
    /// Insert a new `Pending` booking.
    ///
    /// Implementations must enforce the provider exclusion constraint
    /// atomically with the insert: if any active booking of the same provider
    /// overlaps `draft.span`, nothing is written and `StoreError::Overlap` is
    /// returned.
    async fn create(&self, draft: BookingDraft) -> Result<Booking, StoreError>;

    async fn get_by_id(&self, id: Ulid) -> Result<Booking, StoreError>;

    /// Bookings of a provider whose status is in `statuses`, ordered by start.
    /// An empty `statuses` slice means every status.
    async fn list_for_provider(
        &self,
        provider_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, StoreError>;

    /// Same as `list_for_provider`, keyed by requester.
    async fn list_for_requester(
        &self,
        requester_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, StoreError>;

    /// Conditional status update. Fails with `StatusMismatch` (and writes
    /// nothing) unless the stored status still equals `expected`.
    async fn update_status(
        &self,
        id: Ulid,
        new_status: Status,
        actor_id: Option<Ulid>,
        expected: Status,
        updated_at: Ms,
    ) -> Result<Booking, StoreError>;

    /// Confirmed bookings whose `end <= cutoff`.
    async fn list_elapsed(&self, cutoff: Ms) -> Result<Vec<Booking>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Exclusion constraint on (provider, active time range) violated.
    Overlap(Vec<ConflictingBooking>),
    StatusMismatch {
        id: Ulid,
        expected: Status,
        actual: Status,
    },
    /// Backend temporarily unreachable.
    Unavailable(String),
    /// I/O failure while persisting; the write did not happen.
    Io(String),
    /// Backend shut down.
    Closed,
    Corrupt(String),
}

impl StoreError {
    /// Whether a caller may retry the same call with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Io(_) => true,
            StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Overlap(_)
            | StoreError::StatusMismatch { .. }
            | StoreError::Closed
            | StoreError::Corrupt(_) => false,
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "booking not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "booking already exists: {id}"),
            StoreError::Overlap(hits) => {
                write!(f, "exclusion constraint violated by {} booking(s)", hits.len())
            }
            StoreError::StatusMismatch {
                id,
                expected,
                actual,
            } => write!(f, "booking {id} is {actual}, expected {expected}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
            StoreError::Io(e) => write!(f, "store I/O error: {e}"),
            StoreError::Closed => write!(f, "store closed"),
            StoreError::Corrupt(e) => write!(f, "store corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub(crate) fn status_matches(status: Status, statuses: &[Status]) -> bool {
    statuses.is_empty() || statuses.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        assert!(StoreError::Unavailable("conn reset".into()).is_retryable());
        assert!(StoreError::Io("disk full".into()).is_retryable());
        assert!(!StoreError::NotFound(Ulid::new()).is_retryable());
        assert!(!StoreError::Overlap(vec![]).is_retryable());
        assert!(!StoreError::Closed.is_retryable());
        assert!(
            !StoreError::StatusMismatch {
                id: Ulid::new(),
                expected: Status::Pending,
                actual: Status::Confirmed,
            }
            .is_retryable()
        );
    }

    #[test]
    fn empty_status_filter_matches_everything() {
        for s in Status::ALL {
            assert!(status_matches(s, &[]));
        }
        assert!(status_matches(Status::Pending, &Status::ACTIVE));
        assert!(!status_matches(Status::Cancelled, &Status::ACTIVE));
    }
}
