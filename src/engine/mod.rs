mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod window;

pub use conflict::{ConflictReport, detect_conflicts};
pub use error::{EngineError, WindowError};
pub use lifecycle::{is_allowed, next_statuses};
pub use window::validate_window;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::BookingRepository;

/// Booking orchestrator: validation, conflict detection and the status state
/// machine in front of a `BookingRepository`, with lifecycle events fanned out
/// through the `NotifyHub`.
///
/// Every entry point takes the acting party explicitly; the engine never looks
/// up a "current user".
pub struct Engine {
    store: Arc<dyn BookingRepository>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn BookingRepository>, notify: Arc<NotifyHub>) -> Self {
        Self::with_clock(store, notify, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn BookingRepository>,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            notify,
            clock,
        }
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Emit after a successful write. Broadcast cannot fail, so a persisted
    /// change is always announced and an unpersisted one never is.
    fn emit(&self, kind: EventKind, booking: &Booking, timestamp: Ms) {
        let event = BookingEvent::new(kind, booking, timestamp);
        tracing::info!(
            booking = %booking.id,
            provider = %booking.provider_id,
            requester = %booking.requester_id,
            "{}",
            kind.name()
        );
        self.notify.send(&event);
    }
}
