use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::{DEFAULT_GRANULARITY_MS, generate_slots, suggest};
use super::{Engine, EngineError};

/// First instant of the UTC month containing `now`, and of the month after.
fn month_bounds(now: Ms) -> Option<(Ms, Ms)> {
    let today = utc_date(now)?;
    let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
    let next = if today.month() == 12 {
        NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)?
    };
    Some((day_start(first), day_start(next)))
}

impl Engine {
    /// Free start times on `date`. With a service, candidates are the
    /// service's duration long and step by it unless `step_ms` overrides;
    /// without one, the fixed 15-minute granularity applies to both.
    pub async fn availability(
        &self,
        professional_id: Ulid,
        service_id: Option<Ulid>,
        date: NaiveDate,
        step_ms: Option<Ms>,
    ) -> Result<DayAvailability, EngineError> {
        let duration = match service_id {
            Some(id) => {
                let service = self.get_service(&id)?;
                if service.professional_id != professional_id {
                    return Err(EngineError::not_found("service", id));
                }
                service.duration_ms
            }
            None => DEFAULT_GRANULARITY_MS,
        };
        let step = step_ms.unwrap_or(duration);
        if step <= 0 || step > DAY_MS {
            return Err(EngineError::Validation(
                "step must be between 1 minute and 24 hours".into(),
            ));
        }

        let (busy, windows) = self.aggregate_busy(professional_id, date).await?;
        if busy.blocked {
            return Ok(DayAvailability {
                slots: Vec::new(),
                degraded: false,
            });
        }
        let slots = generate_slots(&busy.intervals, &windows, duration, step)
            .into_iter()
            .map(wall_clock_of)
            .collect();
        Ok(DayAvailability {
            slots,
            degraded: busy.degraded,
        })
    }

    /// Up to `max` free slots nearest `preferred`.
    pub async fn suggestions(
        &self,
        professional_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        preferred: Option<WallClock>,
        max: usize,
    ) -> Result<DayAvailability, EngineError> {
        if max == 0 || max > MAX_SUGGESTIONS {
            return Err(EngineError::LimitExceeded("suggestion count"));
        }
        let day = self
            .availability(professional_id, Some(service_id), date, None)
            .await?;
        Ok(DayAvailability {
            slots: suggest(&day.slots, preferred, max),
            degraded: day.degraded,
        })
    }

    /// What a token holder may see. A cancelled booking reads as gone.
    pub async fn booking_by_token(&self, token: &str) -> Result<BookingSummary, EngineError> {
        let (professional_id, reservation_id) = self.resolve_token(token)?;
        let ps = self.get_professional(&professional_id)?;
        let guard = ps.read().await;
        let r = guard
            .reservation(&reservation_id)
            .ok_or_else(|| EngineError::not_found("reservation", reservation_id))?;
        if !matches!(r.status, ReservationStatus::Cancelled { .. }) {
            let service_name = self
                .get_service(&r.service_id)
                .map(|s| s.name)
                .unwrap_or_default();
            return Ok(BookingSummary {
                id: r.id,
                client_name: r.client_name.clone(),
                client_email: r.client_email.clone(),
                service_name,
                professional_name: guard.name.clone(),
                span: r.span,
                status: r.status.label(),
            });
        }
        Err(EngineError::AlreadyCancelled)
    }

    /// Newest first, capped at `MAX_LIST_ROWS`.
    pub async fn list_reservations(
        &self,
        professional_id: Ulid,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        if filter.search.as_ref().is_some_and(|s| s.len() > MAX_SEARCH_LEN) {
            return Err(EngineError::LimitExceeded("search"));
        }
        let ps = self.get_professional(&professional_id)?;
        let guard = ps.read().await;
        Ok(guard
            .reservations
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(MAX_LIST_ROWS)
            .cloned()
            .collect())
    }

    pub async fn booking_stats(
        &self,
        professional_id: Ulid,
        now: Ms,
    ) -> Result<BookingStats, EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let guard = ps.read().await;
        let (month_start, month_end) = month_bounds(now)
            .ok_or_else(|| EngineError::Validation("clock out of range".into()))?;

        let mut stats = BookingStats::default();
        for r in &guard.reservations {
            let in_month = r.span.start >= month_start && r.span.start < month_end;
            if in_month {
                stats.this_month += 1;
            }
            match r.status {
                ReservationStatus::Confirmed => {
                    stats.total_confirmed += 1;
                    if r.span.start >= now {
                        stats.upcoming += 1;
                    }
                    if in_month {
                        stats.monthly_revenue_cents += self
                            .services
                            .get(&r.service_id)
                            .and_then(|s| s.price_cents)
                            .unwrap_or(0);
                    }
                }
                ReservationStatus::Cancelled { .. } => stats.cancelled += 1,
                ReservationStatus::Completed | ReservationStatus::NoShow => {}
            }
        }
        Ok(stats)
    }

    pub async fn list_blocks(&self, professional_id: Ulid) -> Result<Vec<Block>, EngineError> {
        let ps = self.get_professional(&professional_id)?;
        let guard = ps.read().await;
        Ok(guard.active_blocks().cloned().collect())
    }
}
