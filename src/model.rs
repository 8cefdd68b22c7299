use std::fmt;

use chrono::{DateTime, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Calendar anchoring ───────────────────────────────────────────
//
// Every date and wall-clock conversion is anchored to UTC. A date's day
// window is `[date 00:00Z, date+1 00:00Z)`.

/// Start of `date` in UTC.
pub fn day_start(date: NaiveDate) -> Ms {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or_default()
}

pub fn day_window(date: NaiveDate) -> Span {
    let start = day_start(date);
    Span::new(start, start + DAY_MS)
}

/// Instant of `clock` on `date`.
pub fn at(date: NaiveDate, clock: WallClock) -> Ms {
    day_start(date) + clock.minutes() as Ms * MINUTE_MS
}

/// UTC calendar date containing `t`.
pub fn utc_date(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

pub fn rfc3339(t: Ms) -> String {
    DateTime::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| t.to_string())
}

/// UTC wall-clock time of `t`, truncated to the minute.
pub fn wall_clock_of(t: Ms) -> WallClock {
    let minutes = t.rem_euclid(DAY_MS) / MINUTE_MS;
    WallClock(minutes as u16)
}

pub fn parse_weekday(s: &str) -> Option<Weekday> {
    s.trim().parse::<Weekday>().ok()
}

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// Local time of day in minutes after midnight. `24:00` is allowed as a window end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallClock(u16);

impl WallClock {
    pub const END_OF_DAY: WallClock = WallClock(24 * 60);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour * 60 + minute))
    }

    /// Parses `"HH:MM"`.
    pub fn parse(s: &str) -> Option<Self> {
        let (h, m) = s.trim().split_once(':')?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return None;
        }
        Self::from_hm(h.parse().ok()?, m.parse().ok()?)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A `[start, end)` window of wall-clock time, not bound to a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallWindow {
    pub start: WallClock,
    pub end: WallClock,
}

impl WallWindow {
    /// `None` unless `start < end`.
    pub fn new(start: WallClock, end: WallClock) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Materialize on a concrete date.
    pub fn on(&self, date: NaiveDate) -> Span {
        Span::new(at(date, self.start), at(date, self.end))
    }
}

/// Weekday → ordered working windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    days: [Vec<WallWindow>; 7],
}

impl WorkingHours {
    pub fn empty() -> Self {
        Self {
            days: Default::default(),
        }
    }

    pub fn windows(&self, weekday: Weekday) -> &[WallWindow] {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    /// Replace one weekday's windows; kept sorted by start.
    pub fn set(&mut self, weekday: Weekday, mut windows: Vec<WallWindow>) {
        windows.sort_by_key(|w| w.start);
        self.days[weekday.num_days_from_monday() as usize] = windows;
    }
}

impl Default for WorkingHours {
    /// Tue–Fri 09:00–17:00, Sat 10:00–14:00, closed Sunday and Monday.
    fn default() -> Self {
        let window = |sh: u16, eh: u16| WallWindow {
            start: WallClock(sh * 60),
            end: WallClock(eh * 60),
        };
        let mut hours = Self::empty();
        for day in [Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri] {
            hours.set(day, vec![window(9, 17)]);
        }
        hours.set(Weekday::Sat, vec![window(10, 14)]);
        hours
    }
}

// ── Unavailability ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Blocks the whole UTC calendar date.
    FullDay { date: NaiveDate },
    /// Blocks an absolute interval.
    TimeSlot { span: Span },
    /// Blocks the same wall-clock window on every occurrence of `weekday`.
    Recurring { weekday: Weekday, window: WallWindow },
}

impl BlockKind {
    pub fn label(&self) -> &'static str {
        match self {
            BlockKind::FullDay { .. } => "full_day",
            BlockKind::TimeSlot { .. } => "time_slot",
            BlockKind::Recurring { .. } => "recurring",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub kind: BlockKind,
    pub reason: Option<String>,
    /// Soft-delete flag; blocks are never physically removed.
    pub active: bool,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelledBy {
    Client,
    Professional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseOutcome {
    Completed,
    NoShow,
}

/// Reservation lifecycle. Only `Confirmed` has outgoing transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled {
        at: Ms,
        reason: Option<String>,
        by: CancelledBy,
    },
    Completed,
    NoShow,
}

impl ReservationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled { .. } => "cancelled",
            ReservationStatus::Completed => "completed",
            ReservationStatus::NoShow => "no_show",
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed)
    }

    /// Gate for every transition out of the current state.
    pub fn ensure_confirmed(&self) -> Result<(), TransitionError> {
        match self {
            ReservationStatus::Confirmed => Ok(()),
            ReservationStatus::Cancelled { .. } => Err(TransitionError::AlreadyCancelled),
            other => Err(TransitionError::Closed(other.label())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    AlreadyCancelled,
    Closed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub service_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub client_name: String,
    pub client_email: String,
    pub span: Span,
    pub status: ReservationStatus,
    pub external_event_id: Option<String>,
    pub cancellation_token: String,
    pub created_at: Ms,
}

impl Reservation {
    /// Confirmed but never linked to a calendar event.
    pub fn awaiting_calendar_sync(&self) -> bool {
        self.status.is_confirmed() && self.external_event_id.is_none()
    }

    pub fn cancelled_at(&self) -> Option<Ms> {
        match self.status {
            ReservationStatus::Cancelled { at, .. } => Some(at),
            _ => None,
        }
    }

    pub fn cancellation_reason(&self) -> Option<&str> {
        match &self.status {
            ReservationStatus::Cancelled { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub name: String,
    pub duration_ms: Ms,
    pub price_cents: Option<i64>,
}

/// Everything the engine owns for one professional. Guarded by one lock.
#[derive(Debug, Clone)]
pub struct ProfessionalState {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub working_hours: WorkingHours,
    pub blocks: Vec<Block>,
    /// All reservations in any state, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl ProfessionalState {
    pub fn new(id: Ulid, email: String, name: String) -> Self {
        Self {
            id,
            email,
            name,
            working_hours: WorkingHours::default(),
            blocks: Vec::new(),
            reservations: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn active_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.active)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfessionalCreated {
        id: Ulid,
        email: String,
        name: String,
    },
    WorkingHoursSet {
        professional_id: Ulid,
        weekday: Weekday,
        windows: Vec<WallWindow>,
    },
    ServiceCreated {
        service: Service,
    },
    BlockAdded {
        professional_id: Ulid,
        block: Block,
    },
    BlockDeactivated {
        id: Ulid,
        professional_id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ExternalEventLinked {
        id: Ulid,
        professional_id: Ulid,
        event_id: String,
    },
    ReservationCancelled {
        id: Ulid,
        professional_id: Ulid,
        at: Ms,
        reason: Option<String>,
        by: CancelledBy,
    },
    ReservationClosed {
        id: Ulid,
        professional_id: Ulid,
        outcome: CloseOutcome,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Result of a successful booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub id: Ulid,
    pub span: Span,
    pub cancellation_token: String,
    pub cancellation_url: String,
    /// False when the calendar event could not be created yet.
    pub calendar_synced: bool,
}

/// What a token holder may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingSummary {
    pub id: Ulid,
    pub client_name: String,
    pub client_email: String,
    pub service_name: String,
    pub professional_name: String,
    pub span: Span,
    pub status: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingStats {
    pub total_confirmed: u64,
    pub upcoming: u64,
    pub this_month: u64,
    pub cancelled: u64,
    pub monthly_revenue_cents: i64,
}

/// Availability for one day. `degraded` is set when the external calendar
/// could not be consulted and the slots were computed from local data only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAvailability {
    pub slots: Vec<WallClock>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub status: Option<String>,
    pub service_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub from: Option<Ms>,
    pub until: Option<Ms>,
    pub search: Option<String>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        if let Some(status) = &self.status
            && status != "all"
            && r.status.label() != status
        {
            return false;
        }
        if self.service_id.is_some_and(|s| s != r.service_id) {
            return false;
        }
        if self.staff_id.is_some() && self.staff_id != r.staff_id {
            return false;
        }
        if self.from.is_some_and(|from| r.span.start < from) {
            return false;
        }
        if self.until.is_some_and(|until| r.span.start > until) {
            return false;
        }
        if let Some(needle) = &self.search {
            let needle = needle.to_lowercase();
            if !r.client_name.to_lowercase().contains(&needle)
                && !r.client_email.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }
}
