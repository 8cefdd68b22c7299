use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Span;

/// One event on a professional's external calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub id: String,
    /// `None` for all-day or free events, which never count as busy.
    pub span: Option<Span>,
    pub summary: String,
}

/// Event the engine asks the provider to create for a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCalendarEvent {
    pub summary: String,
    pub description: String,
    pub span: Span,
    pub attendees: Vec<String>,
    pub send_notifications: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    Unavailable(String),
    NotFound(String),
    Timeout,
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::Unavailable(msg) => write!(f, "calendar unavailable: {msg}"),
            CalendarError::NotFound(id) => write!(f, "calendar event not found: {id}"),
            CalendarError::Timeout => write!(f, "calendar call timed out"),
        }
    }
}

impl std::error::Error for CalendarError {}

/// The professional's third-party calendar. Read-only for busy time; the
/// engine only writes the events it creates for reservations.
#[async_trait]
pub trait CalendarProvider: Send + Sync {
    /// Events intersecting `window`.
    async fn list_events(
        &self,
        professional_id: Ulid,
        window: Span,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;

    /// Returns the provider's id for the new event.
    async fn insert_event(
        &self,
        professional_id: Ulid,
        event: NewCalendarEvent,
    ) -> Result<String, CalendarError>;

    async fn delete_event(&self, professional_id: Ulid, event_id: &str)
    -> Result<(), CalendarError>;
}

/// Run a calendar call under `limit`, folding the elapsed deadline into `CalendarError::Timeout`.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CalendarError>>,
) -> Result<T, CalendarError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CalendarError::Timeout),
    }
}

/// In-process calendar. Serves the standalone server and the tests; the
/// outage and latency switches stand in for a flaky third party.
#[derive(Default)]
pub struct MemoryCalendar {
    events: DashMap<Ulid, Vec<CalendarEvent>>,
    offline: AtomicBool,
    reject_inserts: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event the professional created outside this system.
    pub fn add_event(&self, professional_id: Ulid, span: Option<Span>, summary: &str) -> String {
        let id = Ulid::new().to_string();
        self.events
            .entry(professional_id)
            .or_default()
            .push(CalendarEvent {
                id: id.clone(),
                span,
                summary: summary.to_string(),
            });
        id
    }

    pub fn events(&self, professional_id: Ulid) -> Vec<CalendarEvent> {
        self.events
            .get(&professional_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Every call fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Only `insert_event` fails; reads keep working.
    pub fn set_reject_inserts(&self, reject: bool) {
        self.reject_inserts.store(reject, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn simulate(&self) -> Result<(), CalendarError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CalendarError::Unavailable("provider offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarProvider for MemoryCalendar {
    async fn list_events(
        &self,
        professional_id: Ulid,
        window: Span,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        self.simulate().await?;
        Ok(self
            .events(professional_id)
            .into_iter()
            .filter(|e| e.span.is_none_or(|s| s.overlaps(&window)))
            .collect())
    }

    async fn insert_event(
        &self,
        professional_id: Ulid,
        event: NewCalendarEvent,
    ) -> Result<String, CalendarError> {
        self.simulate().await?;
        if self.reject_inserts.load(Ordering::SeqCst) {
            return Err(CalendarError::Unavailable("insert rejected".into()));
        }
        Ok(self.add_event(professional_id, Some(event.span), &event.summary))
    }

    async fn delete_event(
        &self,
        professional_id: Ulid,
        event_id: &str,
    ) -> Result<(), CalendarError> {
        self.simulate().await?;
        let mut events = self.events.entry(professional_id).or_default();
        let before = events.len();
        events.retain(|e| e.id != event_id);
        if events.len() == before {
            return Err(CalendarError::NotFound(event_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(span: Span) -> NewCalendarEvent {
        NewCalendarEvent {
            summary: "Cut - Ana".into(),
            description: "cancel: http://localhost:3000/cancel/x".into(),
            span,
            attendees: vec!["ana@example.com".into()],
            send_notifications: true,
        }
    }

    #[tokio::test]
    async fn list_filters_by_window() {
        let cal = MemoryCalendar::new();
        let pid = Ulid::new();
        cal.add_event(pid, Some(Span::new(0, 100)), "early");
        cal.add_event(pid, Some(Span::new(500, 600)), "late");
        cal.add_event(pid, None, "holiday");

        let events = cal.list_events(pid, Span::new(50, 200)).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(names, vec!["early", "holiday"]);
    }

    #[tokio::test]
    async fn insert_then_delete() {
        let cal = MemoryCalendar::new();
        let pid = Ulid::new();
        let id = cal.insert_event(pid, new_event(Span::new(10, 20))).await.unwrap();
        assert_eq!(cal.events(pid).len(), 1);
        cal.delete_event(pid, &id).await.unwrap();
        assert!(cal.events(pid).is_empty());
        assert_eq!(
            cal.delete_event(pid, &id).await,
            Err(CalendarError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn offline_fails_every_call() {
        let cal = MemoryCalendar::new();
        let pid = Ulid::new();
        cal.set_offline(true);
        assert!(cal.list_events(pid, Span::new(0, 10)).await.is_err());
        assert!(cal.insert_event(pid, new_event(Span::new(0, 10))).await.is_err());
        cal.set_offline(false);
        assert!(cal.list_events(pid, Span::new(0, 10)).await.is_ok());
    }

    #[tokio::test]
    async fn rejected_inserts_leave_reads_working() {
        let cal = MemoryCalendar::new();
        let pid = Ulid::new();
        cal.set_reject_inserts(true);
        assert!(cal.insert_event(pid, new_event(Span::new(0, 10))).await.is_err());
        assert!(cal.list_events(pid, Span::new(0, 10)).await.is_ok());
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let cal = MemoryCalendar::new();
        cal.set_latency(Duration::from_millis(200));
        let result = bounded(
            Duration::from_millis(10),
            cal.list_events(Ulid::new(), Span::new(0, 10)),
        )
        .await;
        assert_eq!(result, Err(CalendarError::Timeout));
    }
}
