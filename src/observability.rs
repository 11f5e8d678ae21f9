use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: operation, outcome (`ok` or an error code).
pub const REQUESTS_TOTAL: &str = "bookd_requests_total";

// ── USE metrics (storage) ───────────────────────────────────────

/// Histogram: repository call latency in seconds. Labels: call.
pub const REPOSITORY_CALL_DURATION_SECONDS: &str = "bookd_repository_call_duration_seconds";

/// Counter: repository calls that failed or timed out. Labels: call.
pub const REPOSITORY_FAILURES_TOTAL: &str = "bookd_repository_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookd_wal_flush_batch_size";

/// Counter: queued writes dropped because their caller stopped waiting.
pub const WAL_ABANDONED_WRITES_TOTAL: &str = "bookd_wal_abandoned_writes_total";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "bookd_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Install a `fmt` subscriber for hosts that have none. Ignored if one is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Outcome label for `REQUESTS_TOTAL`.
pub fn outcome_label<T>(result: &Result<T, crate::engine::BookingError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}
