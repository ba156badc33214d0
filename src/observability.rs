use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "bookd_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "bookd_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings persisted in `pending`.
pub const BOOKINGS_CREATED_TOTAL: &str = "bookd_bookings_created_total";

/// Counter: successful status transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "bookd_transitions_total";

/// Counter: requests rejected for overlapping an active booking.
pub const CONFLICTS_TOTAL: &str = "bookd_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Install the fmt subscriber. `RUST_LOG` wins over the default filter.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bookd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
