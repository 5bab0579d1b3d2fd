//! Prometheus metrics for the access-control layer.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `control_tower_access_decisions_total` - Decisions by outcome (bypass, allow, blocked, rate_limited, pattern)
//! - `control_tower_blocks_created_total` - Block rows written (label: blocked_by)
//! - `control_tower_audit_write_failures_total` - Audit writes that failed or timed out (label: event_type)
//! - `control_tower_persistence_errors_total` - Gateway failures (label: operation)
//! - `control_tower_degraded_events_total` - Block-check reads answered "not blocked" because the store failed
//! - `control_tower_fail_open_total` - Requests let through after evaluation failed (label: cause)
//! - `control_tower_admin_auth_failures_total` - Rejected admin API keys
//!
//! ## Histograms
//! - `control_tower_evaluation_duration_seconds` - Time spent deciding allow/deny
//!
//! ## Gauges
//! - `control_tower_rate_windows_tracked` - Addresses with a live rate window
//! - `control_tower_persistence_status` - Last probe result (1 = reachable, 0 = unreachable)

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const ACCESS_DECISIONS_TOTAL: &str = "control_tower_access_decisions_total";
    pub const BLOCKS_CREATED_TOTAL: &str = "control_tower_blocks_created_total";
    pub const AUDIT_WRITE_FAILURES_TOTAL: &str = "control_tower_audit_write_failures_total";
    pub const PERSISTENCE_ERRORS_TOTAL: &str = "control_tower_persistence_errors_total";
    pub const DEGRADED_EVENTS_TOTAL: &str = "control_tower_degraded_events_total";
    pub const FAIL_OPEN_TOTAL: &str = "control_tower_fail_open_total";
    pub const ADMIN_AUTH_FAILURES_TOTAL: &str = "control_tower_admin_auth_failures_total";
    pub const EVALUATION_DURATION_SECONDS: &str = "control_tower_evaluation_duration_seconds";
    pub const RATE_WINDOWS_TRACKED: &str = "control_tower_rate_windows_tracked";
    pub const PERSISTENCE_STATUS: &str = "control_tower_persistence_status";
}

/// Install the Prometheus exporter on `metrics_addr` and describe every metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::ACCESS_DECISIONS_TOTAL,
        "Access-control decisions by outcome"
    );
    describe_counter!(
        names::BLOCKS_CREATED_TOTAL,
        "Block entries written, by origin"
    );
    describe_counter!(
        names::AUDIT_WRITE_FAILURES_TOTAL,
        "Security event writes that failed or did not finish in time"
    );
    describe_counter!(
        names::PERSISTENCE_ERRORS_TOTAL,
        "Persistence gateway failures by operation"
    );
    describe_counter!(
        names::DEGRADED_EVENTS_TOTAL,
        "Block checks answered as not-blocked because the store was unavailable"
    );
    describe_counter!(
        names::FAIL_OPEN_TOTAL,
        "Requests forwarded after access evaluation failed"
    );
    describe_counter!(
        names::ADMIN_AUTH_FAILURES_TOTAL,
        "Admin API requests rejected for a missing or wrong key"
    );

    describe_histogram!(
        names::EVALUATION_DURATION_SECONDS,
        "Access evaluation duration in seconds"
    );

    describe_gauge!(
        names::RATE_WINDOWS_TRACKED,
        "Client addresses with a live rate-limit window"
    );
    describe_gauge!(
        names::PERSISTENCE_STATUS,
        "Persistence reachability (1 = reachable, 0 = unreachable)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record an access decision (`bypass`, `allow`, `blocked`, `rate_limited`, `pattern`).
pub fn record_access_decision(outcome: &'static str) {
    counter!(names::ACCESS_DECISIONS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_block_created(blocked_by: &str) {
    counter!(names::BLOCKS_CREATED_TOTAL, "blocked_by" => blocked_by.to_string()).increment(1);
}

pub fn record_audit_write_failure(event_type: &str) {
    counter!(names::AUDIT_WRITE_FAILURES_TOTAL, "event_type" => event_type.to_string())
        .increment(1);
}

pub fn record_persistence_error(operation: &'static str) {
    counter!(names::PERSISTENCE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn record_degraded_event() {
    counter!(names::DEGRADED_EVENTS_TOTAL).increment(1);
}

/// Record a fail-open (`panic` or `timeout`).
pub fn record_fail_open(cause: &'static str) {
    counter!(names::FAIL_OPEN_TOTAL, "cause" => cause).increment(1);
}

pub fn record_admin_auth_failure() {
    counter!(names::ADMIN_AUTH_FAILURES_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

pub fn record_evaluation_duration(duration_secs: f64) {
    histogram!(names::EVALUATION_DURATION_SECONDS).record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_rate_windows_tracked(count: usize) {
    gauge!(names::RATE_WINDOWS_TRACKED).set(count as f64);
}

pub fn set_persistence_status(reachable: bool) {
    gauge!(names::PERSISTENCE_STATUS).set(if reachable { 1.0 } else { 0.0 });
}
