use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::calendar::CalendarProvider;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::Notifier;
use crate::reconcile;

/// Per-tenant engines. Tenant = database name from the pgwire connection.
/// Each tenant gets its own Engine, WAL, reconciler and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    reconcile_interval: Duration,
    calendar: Arc<dyn CalendarProvider>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        reconcile_interval: Duration,
        calendar: Arc<dyn CalendarProvider>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            reconcile_interval,
            calendar,
            notifier,
            config,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Path traversal guard.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to open the same tenant; only one engine
        // may own the WAL file.
        let entry = self.engines.entry(tenant.to_string());
        let engine = match entry {
            dashmap::mapref::entry::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(
                    wal_path,
                    self.calendar.clone(),
                    self.notifier.clone(),
                    self.config.clone(),
                )?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reconcile::run_reconciler(
            engine.clone(),
            self.reconcile_interval,
        ));
        tokio::spawn(reconcile::run_compactor(
            engine.clone(),
            self.compact_threshold,
        ));

        tracing::info!(tenant = %safe_name, "tenant loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MemoryCalendar;
    use crate::notify::LogNotifier;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("slotkeeper_test_tenant")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(
            dir,
            1000,
            Duration::from_secs(3600),
            Arc::new(MemoryCalendar::default()),
            Arc::new(LogNotifier),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        let pid = Ulid::new();
        eng_a
            .create_professional(pid, "a@example.com".into(), "A".into())
            .await
            .unwrap();
        eng_b
            .create_professional(pid, "b@example.com".into(), "B".into())
            .await
            .unwrap();

        // Close Tuesdays only in tenant A.
        eng_a.clear_working_day(pid, Weekday::Tue).await.unwrap();

        let tuesday = NaiveDate::from_ymd_opt(2030, 6, 4).unwrap();
        let a = eng_a.availability(pid, None, tuesday, None).await.unwrap();
        let b = eng_b.availability(pid, None, tuesday, None).await.unwrap();
        assert!(a.slots.is_empty());
        assert!(!b.slots.is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_state_survives_reload() {
        let dir = test_data_dir("reload");
        let pid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("clinic").unwrap();
            eng.create_professional(pid, "p@example.com".into(), "P".into())
                .await
                .unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("clinic").unwrap();
        assert!(eng.get_professional(&pid).is_ok());
    }
}
