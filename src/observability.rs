use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total engine operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "gridlock_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "gridlock_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: expired holds removed by the background sweep.
pub const HOLDS_REAPED_TOTAL: &str = "gridlock_holds_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "gridlock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "gridlock_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if port
/// is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
