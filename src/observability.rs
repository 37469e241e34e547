use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: store operations. Labels: op, status.
pub const STORE_OPS_TOTAL: &str = "bookings_store_ops_total";

/// Histogram: store operation latency in seconds. Labels: op.
pub const STORE_OP_DURATION_SECONDS: &str = "bookings_store_op_duration_seconds";

/// Counter: booking saga outcomes. Labels: status.
pub const BOOKINGS_TOTAL: &str = "bookings_bookings_total";

/// Counter: calendar post-back writes. Labels: kind (insert, delete), status.
pub const CALENDAR_CHANGES_TOTAL: &str = "bookings_calendar_changes_total";

/// Counter: outbound mail. Labels: status (queued, dropped, sent, failed).
pub const MAIL_TOTAL: &str = "bookings_mail_total";

/// Counter: admin login attempts. Labels: status.
pub const LOGINS_TOTAL: &str = "bookings_logins_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: live sessions.
pub const SESSIONS_ACTIVE: &str = "bookings_sessions_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookings_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookings_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
