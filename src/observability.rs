use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roombook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roombook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings admitted in pending state.
pub const BOOKINGS_ADMITTED_TOTAL: &str = "roombook_bookings_admitted_total";

/// Counter: create/reschedule requests refused because of an overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roombook_booking_conflicts_total";

/// Counter: pending bookings approved or rejected. Labels: status.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "roombook_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "roombook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "roombook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roombook_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "roombook_journal_flush_duration_seconds";

/// Histogram: events per journal flush.
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "roombook_journal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetStatus { .. } => "set_status",
        Command::Reschedule { .. } => "reschedule",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
