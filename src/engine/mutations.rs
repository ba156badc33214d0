use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::StoreError;

use super::conflict::detect_conflicts;
use super::lifecycle::is_allowed;
use super::window::validate_window;
use super::{Engine, EngineError};

/// Blank messages become `None`; overlong ones are rejected.
fn normalize_message(message: Option<String>) -> Result<Option<String>, EngineError> {
    match message {
        Some(m) if m.trim().is_empty() => Ok(None),
        Some(m) if m.chars().count() > MAX_MESSAGE_LEN => {
            Err(EngineError::LimitExceeded("message longer than 500 characters"))
        }
        other => Ok(other),
    }
}

impl Engine {
    /// Submit a new booking request on behalf of `requester_id`.
    ///
    /// Validation runs first, so an out-of-policy window is rejected without
    /// reading the provider's calendar. The store re-checks exclusion
    /// atomically with the insert; losing that race surfaces as the same
    /// `Conflict` error as the pre-check.
    pub async fn request_booking(
        &self,
        provider_id: Ulid,
        requester_id: Ulid,
        start: Ms,
        end: Ms,
        message: Option<String>,
    ) -> Result<Booking, EngineError> {
        if provider_id == requester_id {
            return Err(EngineError::SelfBooking(requester_id));
        }
        let message = normalize_message(message)?;
        let now = self.now_ms();
        let span = validate_window(start, end, now).inspect_err(|e| {
            tracing::debug!("rejected window [{start}, {end}) for provider {provider_id}: {e}");
        })?;
        if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }

        let existing = self
            .store
            .list_for_provider(provider_id, &Status::ACTIVE)
            .await?;
        let report = detect_conflicts(&span, &existing);
        if report.has_conflict() {
            metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            tracing::debug!(
                "window {span} for provider {provider_id} collides with {} booking(s)",
                report.colliding.len()
            );
            return Err(EngineError::Conflict(report.colliding));
        }

        let draft = BookingDraft {
            id: Ulid::new(),
            provider_id,
            requester_id,
            span,
            message,
            created_at: now,
        };
        let booking = self.store.create(draft).await.inspect_err(|e| {
            if matches!(e, StoreError::Overlap(_)) {
                metrics::counter!(observability::CONFLICTS_TOTAL).increment(1);
            } else {
                tracing::warn!("create booking for provider {provider_id} failed: {e}");
            }
        })?;

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        self.emit(EventKind::Created, &booking, booking.created_at);
        Ok(booking)
    }

    /// Move a booking to `target` on behalf of `actor_id`, who must be its
    /// provider or requester.
    pub async fn transition_booking(
        &self,
        id: Ulid,
        target: Status,
        actor_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let booking = self.store.get_by_id(id).await?;
        let role = booking
            .role_of(actor_id)
            .ok_or(EngineError::NotParticipant { id, actor: actor_id })?;
        self.apply_transition(booking, target, role, Some(actor_id)).await
    }

    /// Automatic completion of a confirmed booking whose end time has passed.
    pub async fn complete_elapsed(&self, id: Ulid) -> Result<Booking, EngineError> {
        let booking = self.store.get_by_id(id).await?;
        if booking.status == Status::Confirmed && booking.span.end > self.now_ms() {
            return Err(EngineError::NotYetElapsed(id));
        }
        self.apply_transition(booking, Status::Completed, Role::System, None)
            .await
    }

    async fn apply_transition(
        &self,
        booking: Booking,
        target: Status,
        role: Role,
        actor_id: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        let id = booking.id;
        if !is_allowed(booking.status, target, role) {
            tracing::debug!("refused {role} moving {id} {} -> {target}", booking.status);
            return Err(EngineError::InvalidTransition {
                id,
                from: booking.status,
                to: target,
                role,
            });
        }

        let now = self.now_ms();
        let updated = match self
            .store
            .update_status(id, target, actor_id, booking.status, now)
            .await
        {
            Ok(b) => b,
            Err(StoreError::StatusMismatch { actual, .. }) => {
                tracing::debug!("lost race on {id}: now {actual}, wanted {} -> {target}", booking.status);
                return Err(EngineError::InvalidTransition {
                    id,
                    from: actual,
                    to: target,
                    role,
                });
            }
            Err(e) => {
                tracing::warn!("update of booking {id} to {target} failed: {e}");
                return Err(e.into());
            }
        };

        metrics::counter!(observability::TRANSITIONS_TOTAL, "to" => target.as_str()).increment(1);
        self.emit(EventKind::for_status(target), &updated, now);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_normalisation() {
        assert_eq!(normalize_message(None).unwrap(), None);
        assert_eq!(normalize_message(Some("   ".into())).unwrap(), None);
        assert_eq!(
            normalize_message(Some("see you then".into())).unwrap(),
            Some("see you then".to_string())
        );
        // 500 multi-byte chars is fine, 501 is not.
        assert!(normalize_message(Some("é".repeat(500))).is_ok());
        assert!(matches!(
            normalize_message(Some("é".repeat(501))),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
