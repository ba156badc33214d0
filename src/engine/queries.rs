use ulid::Ulid;

use crate::model::*;

use super::conflict::{ConflictReport, detect_conflicts};
use super::window::validate_window;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        Ok(self.store.get_by_id(id).await?)
    }

    /// Provider's bookings filtered by status (empty = all), ordered by start.
    pub async fn bookings_for_provider(
        &self,
        provider_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_for_provider(provider_id, statuses).await?)
    }

    pub async fn bookings_for_requester(
        &self,
        requester_id: Ulid,
        statuses: &[Status],
    ) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_for_requester(requester_id, statuses).await?)
    }

    /// Dry run of `request_booking`: same validation and conflict detection,
    /// nothing is written.
    pub async fn find_conflicts(
        &self,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<ConflictReport, EngineError> {
        let span = validate_window(start, end, self.now_ms())?;
        let existing = self
            .store
            .list_for_provider(provider_id, &Status::ACTIVE)
            .await?;
        Ok(detect_conflicts(&span, &existing))
    }

    /// Confirmed bookings that have ended and are due for completion.
    pub async fn elapsed_bookings(&self) -> Result<Vec<Booking>, EngineError> {
        Ok(self.store.list_elapsed(self.now_ms()).await?)
    }
}
