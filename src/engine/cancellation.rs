use ulid::Ulid;

use crate::calendar::bounded;
use crate::model::*;
use crate::notify::BookingNotice;

use super::conflict::now_ms;
use super::mutations::validate_reason;
use super::{Engine, EngineError};

const PROFESSIONAL_CANCEL_REASON: &str = "Cancelled by professional";

impl Engine {
    /// Client path: the token is the only credential. Rejected with `TooLate`
    /// inside the notice period.
    pub async fn cancel_by_token(
        &self,
        token: &str,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let (professional_id, reservation_id) = self.resolve_token(token)?;
        self.cancel(professional_id, reservation_id, reason, CancelledBy::Client)
            .await
    }

    /// Professional path: scoped to the professional's own reservations and
    /// not subject to the notice period.
    pub async fn cancel_by_professional(
        &self,
        professional_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
    ) -> Result<Reservation, EngineError> {
        if self.owner_of(&reservation_id) != Some(professional_id) {
            return Err(EngineError::not_found("reservation", reservation_id));
        }
        let reason = reason.or_else(|| Some(PROFESSIONAL_CANCEL_REASON.to_string()));
        self.cancel(professional_id, reservation_id, reason, CancelledBy::Professional)
            .await
    }

    pub(super) fn resolve_token(&self, token: &str) -> Result<(Ulid, Ulid), EngineError> {
        let reservation_id = self
            .reservation_for_token(token)
            .ok_or(EngineError::NotFound("reservation", "for token".into()))?;
        let professional_id = self
            .owner_of(&reservation_id)
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
        Ok((professional_id, reservation_id))
    }

    /// Local state changes first, under the professional's lock. The calendar
    /// delete and the notice follow and never undo the cancellation.
    async fn cancel(
        &self,
        professional_id: Ulid,
        reservation_id: Ulid,
        reason: Option<String>,
        by: CancelledBy,
    ) -> Result<Reservation, EngineError> {
        validate_reason(&reason)?;
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        let current = guard
            .reservation(&reservation_id)
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
        current.status.ensure_confirmed()?;

        let now = now_ms();
        let notice_ms = self.config.cancellation_notice_ms;
        if by == CancelledBy::Client && current.span.start - now < notice_ms {
            return Err(EngineError::TooLate { notice_ms });
        }

        let event = Event::ReservationCancelled {
            id: reservation_id,
            professional_id,
            at: now,
            reason,
            by,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let cancelled = guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
        let (professional_name, professional_email) = (guard.name.clone(), guard.email.clone());
        drop(guard);

        let path = match by {
            CancelledBy::Client => "client",
            CancelledBy::Professional => "professional",
        };
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL, "path" => path).increment(1);
        tracing::info!(
            professional_id = %professional_id,
            reservation_id = %reservation_id,
            path,
            "reservation cancelled"
        );

        if let Some(event_id) = &cancelled.external_event_id
            && let Err(e) = bounded(
                self.config.calendar_timeout,
                self.calendar.delete_event(professional_id, event_id),
            )
            .await
        {
            tracing::warn!(
                reservation_id = %reservation_id,
                event_id = %event_id,
                error = %e,
                "calendar delete failed on cancellation"
            );
        }

        let service_name = self
            .get_service(&cancelled.service_id)
            .map(|s| s.name)
            .unwrap_or_default();
        let notice = BookingNotice {
            reservation_id,
            professional_name,
            professional_email,
            service_name,
            client_name: cancelled.client_name.clone(),
            client_email: cancelled.client_email.clone(),
            start: rfc3339(cancelled.span.start),
            end: rfc3339(cancelled.span.end),
            cancellation_url: None,
            reason: cancelled.cancellation_reason().map(str::to_string),
        };
        if let Err(e) = self.notifier.booking_cancelled(&notice).await {
            tracing::warn!(reservation_id = %reservation_id, error = %e, "cancellation notice failed");
        }

        Ok(cancelled)
    }

    /// Administrative close-out: `completed` or `no_show`. Terminal.
    pub async fn close_reservation(
        &self,
        professional_id: Ulid,
        reservation_id: Ulid,
        outcome: CloseOutcome,
    ) -> Result<Reservation, EngineError> {
        if self.owner_of(&reservation_id) != Some(professional_id) {
            return Err(EngineError::not_found("reservation", reservation_id));
        }
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        guard
            .reservation(&reservation_id)
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?
            .status
            .ensure_confirmed()?;

        let event = Event::ReservationClosed {
            id: reservation_id,
            professional_id,
            outcome,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .reservation(&reservation_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))
    }
}
