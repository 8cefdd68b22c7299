use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Fast-path rejection against local confirmed reservations. The caller holds
/// the professional's write lock, so the answer stays true until it releases.
pub(crate) fn check_no_conflict(ps: &ProfessionalState, span: &Span) -> Result<(), EngineError> {
    match ps
        .overlapping(span)
        .find(|r| r.status.is_confirmed())
    {
        Some(r) => Err(EngineError::SlotTaken(Some(r.id))),
        None => Ok(()),
    }
}

/// Timed external events overlapping `span`. All-day events never conflict.
pub(crate) fn calendar_conflict(events: &[crate::calendar::CalendarEvent], span: &Span) -> bool {
    events
        .iter()
        .filter_map(|e| e.span)
        .any(|busy| busy.overlaps(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarEvent;
    use ulid::Ulid;

    fn with_reservation(span: Span, status: ReservationStatus) -> ProfessionalState {
        let mut ps = ProfessionalState::new(Ulid::new(), "p@example.com".into(), "P".into());
        ps.insert_reservation(Reservation {
            id: Ulid::new(),
            professional_id: ps.id,
            service_id: Ulid::new(),
            staff_id: None,
            client_name: "Ana".into(),
            client_email: "ana@example.com".into(),
            span,
            status,
            external_event_id: None,
            cancellation_token: "tok".into(),
            created_at: 0,
        });
        ps
    }

    #[test]
    fn confirmed_overlap_is_taken() {
        let ps = with_reservation(Span::new(1000, 2000), ReservationStatus::Confirmed);
        assert!(matches!(
            check_no_conflict(&ps, &Span::new(1500, 2500)),
            Err(EngineError::SlotTaken(Some(_)))
        ));
        assert!(check_no_conflict(&ps, &Span::new(2000, 3000)).is_ok());
        assert!(check_no_conflict(&ps, &Span::new(0, 1000)).is_ok());
    }

    #[test]
    fn cancelled_reservation_frees_the_slot() {
        let ps = with_reservation(
            Span::new(1000, 2000),
            ReservationStatus::Cancelled {
                at: 0,
                reason: None,
                by: CancelledBy::Client,
            },
        );
        assert!(check_no_conflict(&ps, &Span::new(1000, 2000)).is_ok());
    }

    #[test]
    fn closed_reservations_do_not_conflict() {
        let ps = with_reservation(Span::new(1000, 2000), ReservationStatus::Completed);
        assert!(check_no_conflict(&ps, &Span::new(1000, 2000)).is_ok());
    }

    #[test]
    fn span_validation() {
        let t = MIN_VALID_TIMESTAMP_MS;
        assert!(validate_span(&Span { start: t + 10, end: t }).is_err());
        assert!(validate_span(&Span { start: 0, end: 10 }).is_err());
        assert!(validate_span(&Span::new(t, t + HOUR_MS)).is_ok());
    }

    #[test]
    fn all_day_events_never_conflict() {
        let events = vec![
            CalendarEvent {
                id: "a".into(),
                span: None,
                summary: "holiday".into(),
            },
            CalendarEvent {
                id: "b".into(),
                span: Some(Span::new(0, 100)),
                summary: "dentist".into(),
            },
        ];
        assert!(calendar_conflict(&events, &Span::new(50, 150)));
        assert!(!calendar_conflict(&events, &Span::new(100, 200)));
    }
}
