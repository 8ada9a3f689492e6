//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "courier_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "courier_sessions_active";
    pub const DISCONNECTS_TOTAL: &str = "courier_disconnects_total";
    pub const MESSAGES_PUSHED_TOTAL: &str = "courier_messages_pushed_total";
    pub const DELIVERIES_TOTAL: &str = "courier_deliveries_total";
    pub const HEARTBEAT_MISSES_TOTAL: &str = "courier_heartbeat_misses_total";
    pub const PUSH_LATENCY_SECONDS: &str = "courier_push_latency_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::SESSIONS_TOTAL, "Sessions bound since node start");
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Sessions currently held by this node");
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Sessions unbound by this node");
    metrics::describe_counter!(
        names::MESSAGES_PUSHED_TOTAL,
        "Messages accepted from local sessions"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Deliveries forwarded to local sessions"
    );
    metrics::describe_counter!(
        names::HEARTBEAT_MISSES_TOTAL,
        "Heartbeats that arrived after the session expired"
    );
    metrics::describe_histogram!(
        names::PUSH_LATENCY_SECONDS,
        "Time from push receipt to acknowledgement"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Errors returned to clients");
    metrics::describe_counter!(
        courier_core::pool::names::PUBLISH_TOTAL,
        "Publish jobs accepted by the broker"
    );
    metrics::describe_counter!(
        courier_core::pool::names::PUBLISH_FAILURES_TOTAL,
        "Publish jobs dropped after a broker failure"
    );
    metrics::describe_counter!(
        courier_core::pool::names::PUBLISH_SATURATED_TOTAL,
        "Submissions that found the publish queue full"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a pushed message.
pub fn record_push(seconds: f64) {
    counter!(names::MESSAGES_PUSHED_TOTAL).increment(1);
    histogram!(names::PUSH_LATENCY_SECONDS).record(seconds);
}

/// Record a delivery to a local session.
pub fn record_delivery() {
    counter!(names::DELIVERIES_TOTAL).increment(1);
}

/// Record a heartbeat for an expired session.
pub fn record_heartbeat_miss() {
    counter!(names::HEARTBEAT_MISSES_TOTAL).increment(1);
}

/// Record an error sent to a client.
pub fn record_error(code: u16) {
    counter!(names::ERRORS_TOTAL, "code" => code.to_string()).increment(1);
}

/// Guard that tracks a bound session, recording the disconnect on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        counter!(names::DISCONNECTS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
