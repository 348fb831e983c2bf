use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations attempted. Labels: outcome.
pub const ADMISSIONS_TOTAL: &str = "slotguard_admissions_total";

/// Histogram: end-to-end `reserve` latency in seconds. Labels: outcome.
pub const ADMISSION_DURATION_SECONDS: &str = "slotguard_admission_duration_seconds";

/// Counter: switches to a degraded substitute. Labels: guard.
pub const FALLBACK_TOTAL: &str = "slotguard_fallback_total";

/// Histogram: time spent waiting on a guard in seconds. Labels: guard.
pub const GUARD_WAIT_SECONDS: &str = "slotguard_guard_wait_seconds";

/// Counter: releases that failed and were left to expiry. Labels: guard.
pub const RELEASE_FAILURES_TOTAL: &str = "slotguard_release_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: rate buckets held by the local store.
pub const LOCAL_RATE_BUCKETS: &str = "slotguard_local_rate_buckets";

/// Gauge: semaphore pools held by the local store.
pub const LOCAL_SEMAPHORE_POOLS: &str = "slotguard_local_semaphore_pools";

/// Gauge: fair locks currently held in the local store.
pub const LOCAL_FAIR_LOCKS: &str = "slotguard_local_fair_locks";

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

/// Install the fmt subscriber for binaries and benches. Safe to call twice.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt().try_init();
}
