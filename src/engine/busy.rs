use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::calendar::bounded;
use crate::model::*;

use super::{Engine, EngineError};

/// Everything that is not bookable on one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyDay {
    /// A full-day block matched; nothing else was evaluated.
    pub blocked: bool,
    pub intervals: Vec<Span>,
    /// The calendar leg failed and `intervals` holds local sources only.
    pub degraded: bool,
}

impl BusyDay {
    fn blocked() -> Self {
        Self {
            blocked: true,
            intervals: Vec::new(),
            degraded: false,
        }
    }
}

/// Local busy sources for `date`: confirmed reservations, time-slot blocks
/// and recurring blocks. A matching full-day block short-circuits.
pub fn local_busy(ps: &ProfessionalState, date: NaiveDate) -> BusyDay {
    let day = day_window(date);

    let full_day = ps
        .active_blocks()
        .any(|b| matches!(b.kind, BlockKind::FullDay { date: d } if d == date));
    if full_day {
        return BusyDay::blocked();
    }

    let mut intervals: Vec<Span> = ps
        .overlapping(&day)
        .filter(|r| r.status.is_confirmed())
        .map(|r| r.span)
        .collect();

    for block in ps.active_blocks() {
        match &block.kind {
            BlockKind::TimeSlot { span } if span.overlaps(&day) => intervals.push(*span),
            BlockKind::Recurring { weekday, window } if *weekday == date.weekday() => {
                intervals.push(window.on(date))
            }
            _ => {}
        }
    }

    BusyDay {
        blocked: false,
        intervals,
        degraded: false,
    }
}

impl Engine {
    /// Merge local and external busy time for one professional and date.
    /// Returns the day's working windows alongside.
    ///
    /// The calendar leg fails open: on error or timeout the result is built
    /// from local sources and flagged `degraded`.
    pub async fn aggregate_busy(
        &self,
        professional_id: Ulid,
        date: NaiveDate,
    ) -> Result<(BusyDay, Vec<Span>), EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let guard = ps.read().await;
        let mut busy = local_busy(&guard, date);
        let windows: Vec<Span> = guard
            .working_hours
            .windows(date.weekday())
            .iter()
            .map(|w| w.on(date))
            .collect();
        drop(guard);

        if busy.blocked || windows.is_empty() {
            return Ok((busy, windows));
        }

        let day = day_window(date);
        match bounded(
            self.config.calendar_timeout,
            self.calendar.list_events(professional_id, day),
        )
        .await
        {
            Ok(events) => {
                busy.intervals
                    .extend(events.into_iter().filter_map(|e| e.span));
            }
            Err(e) => {
                tracing::warn!(
                    professional_id = %professional_id,
                    %date,
                    error = %e,
                    "calendar leg degraded; availability from local sources only"
                );
                metrics::counter!(crate::observability::AVAILABILITY_DEGRADED_TOTAL).increment(1);
                busy.degraded = true;
            }
        }
        Ok((busy, windows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn clock(s: &str) -> WallClock {
        WallClock::parse(s).unwrap()
    }

    fn professional() -> ProfessionalState {
        ProfessionalState::new(Ulid::new(), "p@example.com".into(), "P".into())
    }

    fn block(kind: BlockKind, active: bool) -> Block {
        Block {
            id: Ulid::new(),
            kind,
            reason: None,
            active,
        }
    }

    fn reservation(ps: &ProfessionalState, span: Span, status: ReservationStatus) -> Reservation {
        Reservation {
            id: Ulid::new(),
            professional_id: ps.id,
            service_id: Ulid::new(),
            staff_id: None,
            client_name: "Ana".into(),
            client_email: "ana@example.com".into(),
            span,
            status,
            external_event_id: None,
            cancellation_token: Ulid::new().to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn full_day_block_short_circuits() {
        let d = date("2025-06-03");
        let mut ps = professional();
        let booked = Span::new(at(d, clock("10:00")), at(d, clock("11:00")));
        let r = reservation(&ps, booked, ReservationStatus::Confirmed);
        ps.insert_reservation(r);
        ps.blocks.push(block(BlockKind::FullDay { date: d }, true));

        let busy = local_busy(&ps, d);
        assert!(busy.blocked);
        assert!(busy.intervals.is_empty());
    }

    #[test]
    fn full_day_block_compares_date_only() {
        let d = date("2025-06-03");
        let mut ps = professional();
        ps.blocks.push(block(BlockKind::FullDay { date: d }, true));
        assert!(!local_busy(&ps, date("2025-06-02")).blocked);
        assert!(!local_busy(&ps, date("2025-06-04")).blocked);
    }

    #[test]
    fn inactive_blocks_are_ignored() {
        let d = date("2025-06-03");
        let mut ps = professional();
        ps.blocks.push(block(BlockKind::FullDay { date: d }, false));
        ps.blocks.push(block(
            BlockKind::TimeSlot {
                span: Span::new(at(d, clock("09:00")), at(d, clock("10:00"))),
            },
            false,
        ));
        let busy = local_busy(&ps, d);
        assert!(!busy.blocked);
        assert!(busy.intervals.is_empty());
    }

    #[test]
    fn collects_each_local_source() {
        let d = date("2025-06-02"); // Monday
        let mut ps = professional();
        let booked = Span::new(at(d, clock("10:00")), at(d, clock("11:00")));
        let r = reservation(&ps, booked, ReservationStatus::Confirmed);
        ps.insert_reservation(r);
        let cancelled = reservation(
            &ps,
            Span::new(at(d, clock("14:00")), at(d, clock("15:00"))),
            ReservationStatus::Cancelled {
                at: 0,
                reason: None,
                by: CancelledBy::Client,
            },
        );
        ps.insert_reservation(cancelled);
        let slot = Span::new(at(d, clock("15:30")), at(d, clock("16:00")));
        ps.blocks.push(block(BlockKind::TimeSlot { span: slot }, true));
        let lunch = WallWindow::new(clock("12:00"), clock("13:00")).unwrap();
        ps.blocks.push(block(
            BlockKind::Recurring {
                weekday: chrono::Weekday::Mon,
                window: lunch,
            },
            true,
        ));
        ps.blocks.push(block(
            BlockKind::Recurring {
                weekday: chrono::Weekday::Tue,
                window: lunch,
            },
            true,
        ));

        let busy = local_busy(&ps, d);
        assert!(!busy.blocked);
        assert_eq!(busy.intervals.len(), 3);
        assert!(busy.intervals.contains(&booked));
        assert!(busy.intervals.contains(&slot));
        assert!(busy.intervals.contains(&lunch.on(d)));
    }

    #[test]
    fn reservations_from_other_days_are_skipped() {
        let d = date("2025-06-03");
        let mut ps = professional();
        let prev = date("2025-06-02");
        let r = reservation(
            &ps,
            Span::new(at(prev, clock("10:00")), at(prev, clock("11:00"))),
            ReservationStatus::Confirmed,
        );
        ps.insert_reservation(r);
        assert!(local_busy(&ps, d).intervals.is_empty());
    }

    #[test]
    fn time_slot_crossing_midnight_counts_on_both_days() {
        let d = date("2025-06-03");
        let next = date("2025-06-04");
        let mut ps = professional();
        let late = Span::new(at(d, clock("23:00")), at(next, clock("01:00")));
        ps.blocks.push(block(BlockKind::TimeSlot { span: late }, true));
        assert_eq!(local_busy(&ps, d).intervals, vec![late]);
        assert_eq!(local_busy(&ps, next).intervals, vec![late]);
    }
}
