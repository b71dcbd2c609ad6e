use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── Request metrics ─────────────────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "spotter_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "spotter_request_duration_seconds";

/// Histogram: time to build one slot report, in seconds.
pub const SLOT_GENERATION_SECONDS: &str = "spotter_slot_generation_seconds";

// ── Booking workflow ────────────────────────────────────────────

/// Counter: committed booking transitions. Labels: action, status.
pub const BOOKINGS_TOTAL: &str = "spotter_bookings_total";

/// Counter: rejected booking writes. Labels: code.
pub const BOOKING_REJECTIONS_TOTAL: &str = "spotter_booking_rejections_total";

/// Counter: calendar sync calls that failed or timed out. Labels: operation.
pub const SYNC_FAILURES_TOTAL: &str = "spotter_sync_failures_total";

// ── Connections ─────────────────────────────────────────────────

/// Gauge: open TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spotter_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spotter_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spotter_connections_rejected_total";

// ── Storage ─────────────────────────────────────────────────────

/// Gauge: trainers held in memory.
pub const TRAINERS_LOADED: &str = "spotter_trainers_loaded";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotter_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotter_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "spotter_wal_compactions_total";

/// Install the Prometheus exporter on `port`. Does nothing without a port.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short status label for request counters.
pub fn status_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}
