//! Metrics collection and exposition.
//!
//! # Metrics
//! - `miniproxy_connections_accepted_total` (counter)
//! - `miniproxy_active_connections` (gauge): current in-flight handlers
//! - `miniproxy_accept_errors_total` (counter): by `kind` (transient, fatal)
//! - `miniproxy_handler_panics_total` (counter)
//! - `miniproxy_shutdowns_total` (counter): by `outcome` (graceful, timeout)
//! - `miniproxy_shutdown_duration_seconds` (histogram)
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_accepted() {
    ::metrics::counter!("miniproxy_connections_accepted_total").increment(1);
}

/// Relative updates, so concurrent open/close calls cannot publish a stale count.
pub fn connection_opened() {
    ::metrics::gauge!("miniproxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    ::metrics::gauge!("miniproxy_active_connections").decrement(1.0);
}

pub fn record_accept_error(kind: &'static str) {
    ::metrics::counter!("miniproxy_accept_errors_total", "kind" => kind).increment(1);
}

pub fn record_handler_panic() {
    ::metrics::counter!("miniproxy_handler_panics_total").increment(1);
}

pub fn record_shutdown(outcome: &'static str, elapsed: Duration) {
    ::metrics::counter!("miniproxy_shutdowns_total", "outcome" => outcome).increment(1);
    ::metrics::histogram!("miniproxy_shutdown_duration_seconds").record(elapsed.as_secs_f64());
}
