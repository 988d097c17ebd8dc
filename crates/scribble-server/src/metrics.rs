//! Metrics collection and export for Scribble.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use scribble_core::PublishReport;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "scribble_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "scribble_connections_active";
    pub const JOINS_TOTAL: &str = "scribble_joins_total";
    pub const BOARDS_ACTIVE: &str = "scribble_boards_active";
    pub const STROKES_TOTAL: &str = "scribble_strokes_total";
    pub const FANOUT_DELIVERED: &str = "scribble_fanout_delivered_total";
    pub const FANOUT_DROPPED: &str = "scribble_fanout_dropped_total";
    pub const STORE_ERRORS_TOTAL: &str = "scribble_store_errors_total";
    pub const REPLAYED_TOTAL: &str = "scribble_replayed_strokes_total";
    pub const REPLAY_SECONDS: &str = "scribble_replay_seconds";
    pub const PUBLISH_SECONDS: &str = "scribble_publish_seconds";
    pub const ERRORS_TOTAL: &str = "scribble_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of sockets accepted since server start"
    );
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Current number of open sockets");
    metrics::describe_counter!(names::JOINS_TOTAL, "Board join attempts by outcome");
    metrics::describe_gauge!(names::BOARDS_ACTIVE, "Boards with at least one connection");
    metrics::describe_counter!(names::STROKES_TOTAL, "Stroke segments published");
    metrics::describe_counter!(
        names::FANOUT_DELIVERED,
        "Stroke deliveries enqueued for peers"
    );
    metrics::describe_counter!(
        names::FANOUT_DROPPED,
        "Stroke deliveries dropped, by reason"
    );
    metrics::describe_counter!(
        names::STORE_ERRORS_TOTAL,
        "Failed event log operations, by operation"
    );
    metrics::describe_counter!(names::REPLAYED_TOTAL, "Strokes delivered by history replay");
    metrics::describe_histogram!(names::REPLAY_SECONDS, "Time spent replaying history on join");
    metrics::describe_histogram!(
        names::PUBLISH_SECONDS,
        "Time from receiving a stroke to fan-out and append"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new socket.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed socket.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record the outcome of a join.
pub fn record_join(outcome: &'static str) {
    counter!(names::JOINS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a finished replay.
pub fn record_replay(events: u64, seconds: f64) {
    counter!(names::REPLAYED_TOTAL).increment(events);
    histogram!(names::REPLAY_SECONDS).record(seconds);
}

/// Record what happened to a published stroke.
pub fn record_publish(report: &PublishReport, seconds: f64) {
    counter!(names::STROKES_TOTAL).increment(1);
    counter!(names::FANOUT_DELIVERED).increment(report.delivered as u64);
    for (_, reason) in &report.dropped {
        counter!(names::FANOUT_DROPPED, "reason" => reason.to_string()).increment(1);
    }
    if !report.persisted() {
        record_store_error("append");
    }
    histogram!(names::PUBLISH_SECONDS).record(seconds);
}

/// Record a failed event log operation.
pub fn record_store_error(operation: &'static str) {
    counter!(names::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

/// Update active board count.
pub fn set_active_boards(count: usize) {
    gauge!(names::BOARDS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
