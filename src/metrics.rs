// src/metrics.rs

#[cfg(feature = "observability")]
use metrics::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter,
};

// Without the observability feature every recording call compiles to nothing.
#[cfg(not(feature = "observability"))]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $name;
        $( let _ = ($label, $label_value); )*
    }};
}

#[cfg(not(feature = "observability"))]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = ($name, $value);
        $( let _ = ($label, $label_value); )*
    }};
}

#[cfg(not(feature = "observability"))]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = ($name, $value);
        $( let _ = ($label, $label_value); )*
    }};
}

#[cfg(not(feature = "observability"))]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {{
        let _ = ($name, $desc);
    }};
}

#[cfg(not(feature = "observability"))]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {{
        let _ = ($name, $desc);
    }};
}

#[cfg(not(feature = "observability"))]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {{
        let _ = ($name, $desc);
    }};
}

use crate::connection::ConnectionState;
use std::time::Duration;

/// Initializes the descriptions for all the metrics in the crate.
/// This should be called once at startup.
pub fn describe_metrics() {
    // Connection
    describe_gauge!(
        "ledger_connection_state",
        "Connection state (0=disconnected, 1=connecting, 2=connected)."
    );
    describe_counter!(
        "ledger_reconnect_attempts_total",
        "Automatic reconnect attempts scheduled after unsolicited disconnects."
    );

    // Queue
    describe_gauge!("ledger_queue_depth", "Requests waiting in the request queue.");
    describe_histogram!(
        "ledger_queue_wait_ms",
        "Time between enqueue and dispatch, in milliseconds."
    );

    // Facade
    describe_counter!(
        "ledger_requests_total",
        "Ledger requests by command and outcome."
    );
    describe_histogram!(
        "ledger_request_latency_ms",
        "Ledger request latency including queueing, in milliseconds."
    );

    // Cache
    describe_counter!("ledger_cache_hits_total", "Fresh cache hits by data kind.");
    describe_counter!(
        "ledger_cache_stale_hits_total",
        "Stale-but-usable cache hits by data kind."
    );
    describe_counter!("ledger_cache_misses_total", "Cache misses by data kind.");
    describe_counter!(
        "ledger_cache_store_errors_total",
        "Cache store failures by operation."
    );
    describe_counter!(
        "ledger_cache_refresh_total",
        "Background refreshes by outcome."
    );
}

/// Installs the Prometheus exporter on `addr` (e.g. `0.0.0.0:9000`).
#[cfg(feature = "observability")]
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
    };
    gauge!("ledger_connection_state", value);
}

pub fn increment_reconnect_attempt() {
    increment_counter!("ledger_reconnect_attempts_total");
}

pub fn set_queue_depth(depth: usize) {
    gauge!("ledger_queue_depth", depth as f64);
}

pub fn record_queue_wait(waited: Duration) {
    histogram!("ledger_queue_wait_ms", waited.as_secs_f64() * 1000.0);
}

pub fn increment_ledger_request(command: &str, outcome: &str) {
    increment_counter!(
        "ledger_requests_total",
        "command" => command.to_string(),
        "outcome" => outcome.to_string()
    );
}

pub fn record_ledger_request_latency(command: &str, latency: Duration) {
    histogram!(
        "ledger_request_latency_ms",
        latency.as_secs_f64() * 1000.0,
        "command" => command.to_string()
    );
}

pub fn increment_cache_hit(kind: &str) {
    increment_counter!("ledger_cache_hits_total", "kind" => kind.to_string());
}

pub fn increment_cache_stale_hit(kind: &str) {
    increment_counter!("ledger_cache_stale_hits_total", "kind" => kind.to_string());
}

pub fn increment_cache_miss(kind: &str) {
    increment_counter!("ledger_cache_misses_total", "kind" => kind.to_string());
}

pub fn increment_cache_store_error(operation: &'static str) {
    increment_counter!("ledger_cache_store_errors_total", "operation" => operation);
}

pub fn increment_cache_refresh(outcome: &'static str) {
    increment_counter!("ledger_cache_refresh_total", "outcome" => outcome);
}
