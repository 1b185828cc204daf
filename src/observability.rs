use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "tutorsched_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "tutorsched_http_request_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: schedule entries persisted (one per occurrence). Labels: recurrence.
pub const OCCURRENCES_CREATED_TOTAL: &str = "tutorsched_occurrences_created_total";

/// Counter: creation requests that ended in an error. Labels: reason.
pub const CREATIONS_REJECTED_TOTAL: &str = "tutorsched_creations_rejected_total";

/// Counter: conflict rows recorded. Labels: tag.
pub const CONFLICTS_RECORDED_TOTAL: &str = "tutorsched_conflicts_recorded_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "tutorsched_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tutorsched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tutorsched_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
