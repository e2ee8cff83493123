use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: reservations persisted.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "innkeep_reservations_committed_total";

/// Counter: commit attempts that ended without a reservation. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "innkeep_reservations_rejected_total";

/// Histogram: payment gateway charge latency in seconds, timeouts included.
pub const PAYMENT_DURATION_SECONDS: &str = "innkeep_payment_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResort { .. } => "insert_resort",
        Command::InsertRoom { .. } => "insert_room",
        Command::InsertPhoto { .. } => "insert_photo",
        Command::DeleteRoom { .. } => "delete_room",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SelectRooms { .. } => "select_rooms",
        Command::CountRooms { .. } => "count_rooms",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations { .. } => "select_reservations",
    }
}
