use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that retries calendar sync for reservations whose event
/// creation failed after commit.
pub async fn run_reconciler(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately; nothing can be pending yet.
    interval.tick().await;
    loop {
        interval.tick().await;
        let linked = engine.reconcile_calendar().await;
        if linked > 0 {
            info!(linked, "reconciler pass complete");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MemoryCalendar;
    use crate::config::EngineConfig;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::LogNotifier;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_reconcile");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reconciler_links_unsynced_booking() {
        let calendar = Arc::new(MemoryCalendar::default());
        let engine = Arc::new(
            Engine::new(
                test_wal_path("reconciler_links.wal"),
                calendar.clone(),
                Arc::new(LogNotifier),
                EngineConfig {
                    calendar_timeout: Duration::from_millis(100),
                    ..EngineConfig::default()
                },
            )
            .unwrap(),
        );

        let pid = Ulid::new();
        let sid = Ulid::new();
        engine
            .create_professional(pid, "pro@example.com".into(), "Pro".into())
            .await
            .unwrap();
        engine
            .create_service(Service {
                id: sid,
                professional_id: pid,
                name: "Consult".into(),
                duration_ms: HOUR_MS,
                price_cents: None,
            })
            .await
            .unwrap();

        calendar.set_reject_inserts(true);
        let tuesday = NaiveDate::from_ymd_opt(2030, 6, 4).unwrap();
        let receipt = engine
            .book(BookingRequest {
                professional_id: pid,
                service_id: sid,
                staff_id: None,
                start: at(tuesday, WallClock::from_hm(10, 0).unwrap()),
                client_name: "Ana".into(),
                client_email: "ana@example.com".into(),
            })
            .await
            .unwrap();
        assert!(!receipt.calendar_synced);

        calendar.set_reject_inserts(false);
        let task = tokio::spawn(run_reconciler(engine.clone(), Duration::from_millis(20)));

        let mut linked = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.unsynced_reservations(0).await.is_empty() {
                linked = true;
                break;
            }
        }
        task.abort();
        assert!(linked, "reconciler never linked the reservation");
        assert_eq!(calendar.events(pid).len(), 1);
    }
}
