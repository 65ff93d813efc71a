use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: console statements executed. Labels: command, table, status.
pub const QUERIES_TOTAL: &str = "clinic_queries_total";

/// Histogram: console statement latency in seconds. Labels: command, table.
pub const QUERY_DURATION_SECONDS: &str = "clinic_query_duration_seconds";

/// Counter: HTTP requests served. Labels: method, status.
pub const HTTP_REQUESTS_TOTAL: &str = "clinic_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: method.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "clinic_http_request_duration_seconds";

/// Counter: bookings refused because the doctor was already taken.
pub const OVERLAP_REJECTIONS_TOTAL: &str = "clinic_overlap_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active console connections.
pub const CONNECTIONS_ACTIVE: &str = "clinic_connections_active";

/// Counter: total console connections accepted.
pub const CONNECTIONS_TOTAL: &str = "clinic_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "clinic_connections_rejected_total";

/// Gauge: number of loaded clinics.
pub const TENANTS_ACTIVE: &str = "clinic_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "clinic_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "clinic_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "clinic_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::Insert { .. } => "insert",
        Command::Update { .. } => "update",
        Command::Delete { .. } => "delete",
        Command::Select { .. } => "select",
    }
}
