//! Metrics collection and export for an ecology node.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const EVENTS_TOTAL: &str = "ecology_events_total";
    pub const DATA_CHANGES_TOTAL: &str = "ecology_data_changes_total";
    pub const DATA_KEYS: &str = "ecology_data_keys";
    pub const CONNECTORS_ACTIVE: &str = "ecology_connectors_active";
    pub const CONNECTORS_TOTAL: &str = "ecology_connectors_total";
    pub const ERRORS_TOTAL: &str = "ecology_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(names::EVENTS_TOTAL, "Room events delivered on this device");
    metrics::describe_counter!(
        names::DATA_CHANGES_TOTAL,
        "Data store changes applied on this device"
    );
    metrics::describe_gauge!(names::DATA_KEYS, "Keys currently held in the data store");
    metrics::describe_gauge!(
        names::CONNECTORS_ACTIVE,
        "Connectors currently connected"
    );
    metrics::describe_gauge!(names::CONNECTORS_TOTAL, "Connectors configured");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a delivered room event.
pub fn record_event(room: &str, event_type: &str) {
    counter!(
        names::EVENTS_TOTAL,
        "room" => room.to_string(),
        "event" => event_type.to_string()
    )
    .increment(1);
}

/// Record a data change. `deleted` is true when the key was removed.
pub fn record_data_change(deleted: bool) {
    let op = if deleted { "delete" } else { "set" };
    counter!(names::DATA_CHANGES_TOTAL, "op" => op).increment(1);
}

/// Update connector and store gauges.
pub fn set_node_state(connected: usize, configured: usize, keys: usize) {
    gauge!(names::CONNECTORS_ACTIVE).set(connected as f64);
    gauge!(names::CONNECTORS_TOTAL).set(configured as f64);
    gauge!(names::DATA_KEYS).set(keys as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}
