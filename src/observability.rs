use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "seatline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "seatline_query_duration_seconds";

// ── Reservation engine ──────────────────────────────────────────

/// Counter: admission outcomes. Labels: outcome (confirmed, waitlisted, existing, rejected).
pub const RESERVATIONS_TOTAL: &str = "seatline_reservations_total";

/// Counter: waitlisted reservations promoted to confirmed.
pub const PROMOTIONS_TOTAL: &str = "seatline_promotions_total";

/// Counter: reservations cancelled.
pub const CANCELLATIONS_TOTAL: &str = "seatline_cancellations_total";

/// Counter: units of work retried after a transaction conflict.
pub const TXN_RETRIES_TOTAL: &str = "seatline_txn_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "seatline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "seatline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "seatline_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "seatline_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatline_wal_flush_batch_size";

/// Install the Prometheus exporter on `bind:port`. No-op if port is None.
pub fn init(bind: &str, port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| format!("bad metrics address: {e}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SetResourceOpen { .. } => "set_resource_open",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources => "select_resources",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::CompleteReservation { .. } => "complete_reservation",
        Command::SelectReservation { .. } => "select_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectWaitlist { .. } => "select_waitlist",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
