use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotkeeper_bookings_total";

/// Counter: confirmed cancellations. Labels: path (client, professional).
pub const CANCELLATIONS_TOTAL: &str = "slotkeeper_cancellations_total";

// ── Calendar collaborator ───────────────────────────────────────

/// Counter: availability answers computed without the external calendar.
pub const AVAILABILITY_DEGRADED_TOTAL: &str = "slotkeeper_availability_degraded_total";

/// Counter: calendar event creations that failed after a booking committed.
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "slotkeeper_calendar_sync_failures_total";

/// Counter: reconciler retries. Labels: outcome (linked, failed).
pub const RECONCILIATIONS_TOTAL: &str = "slotkeeper_reconciliations_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProfessional { .. } => "insert_professional",
        Command::InsertWorkingHours { .. } => "insert_working_hours",
        Command::DeleteWorkingHours { .. } => "delete_working_hours",
        Command::InsertService { .. } => "insert_service",
        Command::InsertBlock { .. } => "insert_block",
        Command::DeleteBlock { .. } => "delete_block",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectSuggestions { .. } => "select_suggestions",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBookingByToken { .. } => "select_booking_by_token",
        Command::CancelByToken { .. } => "cancel_by_token",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectBookingStats { .. } => "select_booking_stats",
    }
}
