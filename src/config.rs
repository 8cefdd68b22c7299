use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::{HOUR_MS, Ms};

/// Knobs the engine consults at request time.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on every external calendar call.
    pub calendar_timeout: Duration,
    /// Minimum lead time for a client-initiated cancellation.
    pub cancellation_notice_ms: Ms,
    /// Base of the cancellation link embedded in calendar events and receipts.
    pub public_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            calendar_timeout: Duration::from_secs(2),
            cancellation_notice_ms: 24 * HOUR_MS,
            public_url: "http://localhost:3000".into(),
        }
    }
}

impl EngineConfig {
    pub fn cancellation_url(&self, token: &str) -> String {
        format!("{}/cancel/{token}", self.public_url.trim_end_matches('/'))
    }
}

/// Process-wide settings, read once from `SLOTKEEPER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub reconcile_interval: Duration,
    pub engine: EngineConfig,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        let calendar_timeout_ms: u64 = env_or(
            "SLOTKEEPER_CALENDAR_TIMEOUT_MS",
            defaults.calendar_timeout.as_millis() as u64,
        );
        let notice_hours: i64 = env_or("SLOTKEEPER_CANCELLATION_NOTICE_HOURS", 24);

        Self {
            port: env_or("SLOTKEEPER_PORT", 5433),
            bind: std::env::var("SLOTKEEPER_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            data_dir: PathBuf::from(
                std::env::var("SLOTKEEPER_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            password: std::env::var("SLOTKEEPER_PASSWORD").unwrap_or_else(|_| "slotkeeper".into()),
            max_connections: env_or("SLOTKEEPER_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("SLOTKEEPER_COMPACT_THRESHOLD", 1000),
            metrics_port: std::env::var("SLOTKEEPER_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            tls_cert: std::env::var("SLOTKEEPER_TLS_CERT").ok(),
            tls_key: std::env::var("SLOTKEEPER_TLS_KEY").ok(),
            reconcile_interval: Duration::from_secs(env_or(
                "SLOTKEEPER_RECONCILE_INTERVAL_SECS",
                30,
            )),
            engine: EngineConfig {
                calendar_timeout: Duration::from_millis(calendar_timeout_ms),
                cancellation_notice_ms: notice_hours * HOUR_MS,
                public_url: std::env::var("SLOTKEEPER_PUBLIC_URL")
                    .unwrap_or(defaults.public_url),
            },
        }
    }
}
