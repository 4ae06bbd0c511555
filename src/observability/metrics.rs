//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define gateway metrics (requests, latency, relay errors, sessions)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `gateway_requests_total` (counter): total requests by method, status
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//! - `gateway_upstream_errors_total` (counter): relay failures by phase
//! - `gateway_websocket_sessions_active` (gauge): open WebSocket sessions
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an
//!   exporter is installed, so library code and tests never need one

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const UPSTREAM_ERRORS_TOTAL: &str = "gateway_upstream_errors_total";
    pub const WEBSOCKET_SESSIONS_ACTIVE: &str = "gateway_websocket_sessions_active";
}

/// Install the Prometheus exporter serving `/metrics` on `addr`.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Record one completed request.
pub fn record_request(method: &str, status: u16, duration: Duration) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a relay failure in the given phase (`build`, `call`, `dial`...).
pub fn record_upstream_error(phase: &'static str) {
    counter!(names::UPSTREAM_ERRORS_TOTAL, "phase" => phase).increment(1);
}

pub fn websocket_session_opened() {
    gauge!(names::WEBSOCKET_SESSIONS_ACTIVE).increment(1.0);
}

pub fn websocket_session_closed() {
    gauge!(names::WEBSOCKET_SESSIONS_ACTIVE).decrement(1.0);
}
