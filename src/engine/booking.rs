use rand::RngCore;
use rand::rngs::OsRng;
use ulid::Ulid;

use crate::calendar::{NewCalendarEvent, bounded};
use crate::limits::*;
use crate::model::*;
use crate::notify::BookingNotice;

use super::conflict::{calendar_conflict, check_no_conflict, now_ms, validate_span};
use super::mutations::{validate_email, validate_text};
use super::{Engine, EngineError, SharedProfessional};

/// A client's slot choice. The end is never supplied; it comes from the service.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub professional_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub start: Ms,
    pub client_name: String,
    pub client_email: String,
}

/// 256 bits from the OS CSPRNG, hex encoded.
fn new_cancellation_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn booking_outcome(result: &Result<BookingReceipt, EngineError>) -> &'static str {
    match result {
        Ok(r) if r.calendar_synced => "confirmed",
        Ok(_) => "confirmed_unsynced",
        Err(EngineError::SlotTaken(_)) => "slot_taken",
        Err(EngineError::CalendarUnavailable(_)) => "calendar_unavailable",
        Err(EngineError::Persistence(_)) => "persistence_failure",
        Err(_) => "rejected",
    }
}

impl Engine {
    /// Turn a slot choice into a durable reservation.
    ///
    /// The professional's write lock is held from the conflict re-check
    /// through the local insert, so two confirmed reservations of one
    /// professional never overlap. The calendar event is created after the
    /// lock is released; if that fails the reservation stands and the
    /// reconciler retries the sync.
    pub async fn book(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let result = self.book_inner(req).await;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => booking_outcome(&result))
            .increment(1);
        result
    }

    async fn book_inner(&self, req: BookingRequest) -> Result<BookingReceipt, EngineError> {
        validate_text(&req.client_name, "client name", MAX_NAME_LEN)?;
        validate_email(&req.client_email)?;

        let service = self.get_service(&req.service_id)?;
        if service.professional_id != req.professional_id {
            return Err(EngineError::not_found("service", req.service_id));
        }
        let end = req
            .start
            .checked_add(service.duration_ms)
            .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
        let span = Span {
            start: req.start,
            end,
        };
        validate_span(&span)?;

        let ps = self.get_professional(&req.professional_id)?;
        let mut guard = ps.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many reservations"));
        }

        let (external, local) = tokio::join!(
            bounded(
                self.config.calendar_timeout,
                self.calendar.list_events(req.professional_id, span),
            ),
            async { check_no_conflict(&guard, &span) },
        );
        local?;
        let events = external.map_err(|e| {
            tracing::warn!(
                professional_id = %req.professional_id,
                error = %e,
                "booking rejected: calendar conflict check could not complete"
            );
            EngineError::CalendarUnavailable(e.to_string())
        })?;
        if calendar_conflict(&events, &span) {
            return Err(EngineError::SlotTaken(None));
        }

        let mut token = new_cancellation_token();
        while self.reservation_for_token(&token).is_some() {
            token = new_cancellation_token();
        }
        let reservation = Reservation {
            id: Ulid::new(),
            professional_id: req.professional_id,
            service_id: req.service_id,
            staff_id: req.staff_id,
            client_name: req.client_name,
            client_email: req.client_email,
            span,
            status: ReservationStatus::Confirmed,
            external_event_id: None,
            cancellation_token: token,
            created_at: now_ms(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let (professional_name, professional_email) = (guard.name.clone(), guard.email.clone());
        drop(guard);

        tracing::info!(
            professional_id = %reservation.professional_id,
            reservation_id = %reservation.id,
            start = %rfc3339(span.start),
            "reservation confirmed"
        );

        let calendar_synced = self.sync_calendar_event(&reservation, &service).await;
        let cancellation_url = self.config.cancellation_url(&reservation.cancellation_token);

        let notice = BookingNotice {
            reservation_id: reservation.id,
            professional_name,
            professional_email,
            service_name: service.name.clone(),
            client_name: reservation.client_name.clone(),
            client_email: reservation.client_email.clone(),
            start: rfc3339(span.start),
            end: rfc3339(span.end),
            cancellation_url: Some(cancellation_url.clone()),
            reason: None,
        };
        if let Err(e) = self.notifier.booking_confirmed(&notice).await {
            tracing::warn!(reservation_id = %reservation.id, error = %e, "confirmation notice failed");
        }

        Ok(BookingReceipt {
            id: reservation.id,
            span,
            cancellation_token: reservation.cancellation_token,
            cancellation_url,
            calendar_synced,
        })
    }

    /// Create the calendar event for a reservation and link it. Returns
    /// whether the reservation ends up linked. Failures are logged and left
    /// for the reconciler.
    pub(super) async fn sync_calendar_event(
        &self,
        reservation: &Reservation,
        service: &Service,
    ) -> bool {
        let link = self.config.cancellation_url(&reservation.cancellation_token);
        let new_event = NewCalendarEvent {
            summary: format!("{} - {}", service.name, reservation.client_name),
            description: format!(
                "Client: {}\nEmail: {}\n\nTo cancel this appointment: {link}",
                reservation.client_name, reservation.client_email
            ),
            span: reservation.span,
            attendees: vec![reservation.client_email.clone()],
            send_notifications: true,
        };

        let inserted = bounded(
            self.config.calendar_timeout,
            self.calendar
                .insert_event(reservation.professional_id, new_event),
        )
        .await;
        let event_id = match inserted {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    professional_id = %reservation.professional_id,
                    reservation_id = %reservation.id,
                    error = %e,
                    "calendar sync failed; queued for reconciliation"
                );
                metrics::counter!(crate::observability::CALENDAR_SYNC_FAILURES_TOTAL).increment(1);
                return false;
            }
        };

        match self
            .link_external_event(reservation.professional_id, reservation.id, event_id)
            .await
        {
            Ok(linked) => linked,
            Err(e) => {
                tracing::warn!(
                    reservation_id = %reservation.id,
                    error = %e,
                    "could not record calendar event link"
                );
                false
            }
        }
    }

    /// Attach a freshly created calendar event. If the reservation was
    /// cancelled or closed meanwhile, or another sync already linked it, the
    /// new event is deleted again and `Ok(false)` is returned.
    async fn link_external_event(
        &self,
        professional_id: Ulid,
        reservation_id: Ulid,
        event_id: String,
    ) -> Result<bool, EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let mut guard = ps.write().await;
        let current = guard
            .reservation(&reservation_id)
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;

        if current.awaiting_calendar_sync() {
            let event = Event::ExternalEventLinked {
                id: reservation_id,
                professional_id,
                event_id,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            return Ok(true);
        }
        let already_linked = current.status.is_confirmed();
        drop(guard);

        if let Err(e) = bounded(
            self.config.calendar_timeout,
            self.calendar.delete_event(professional_id, &event_id),
        )
        .await
        {
            tracing::warn!(
                reservation_id = %reservation_id,
                event_id = %event_id,
                error = %e,
                "could not remove stale calendar event"
            );
        }
        Ok(already_linked)
    }

    /// Confirmed, not yet ended reservations whose calendar event is missing.
    pub async fn unsynced_reservations(&self, now: Ms) -> Vec<Reservation> {
        let professionals: Vec<SharedProfessional> =
            self.professionals.iter().map(|e| e.value().clone()).collect();
        let mut pending = Vec::new();
        for ps in professionals {
            let guard = ps.read().await;
            pending.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.awaiting_calendar_sync() && r.span.end > now)
                    .cloned(),
            );
        }
        pending
    }

    /// Retry calendar sync for every unsynced reservation. Returns how many
    /// were linked.
    pub async fn reconcile_calendar(&self) -> usize {
        let mut linked = 0;
        for reservation in self.unsynced_reservations(now_ms()).await {
            let Ok(service) = self.get_service(&reservation.service_id) else {
                continue;
            };
            let ok = self.sync_calendar_event(&reservation, &service).await;
            metrics::counter!(
                crate::observability::RECONCILIATIONS_TOTAL,
                "outcome" => if ok { "linked" } else { "failed" }
            )
            .increment(1);
            if ok {
                linked += 1;
                tracing::info!(
                    professional_id = %reservation.professional_id,
                    reservation_id = %reservation.id,
                    "calendar event reconciled"
                );
            }
        }
        linked
    }
}
