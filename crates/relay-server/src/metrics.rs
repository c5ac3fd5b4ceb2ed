//! Prometheus metrics recorder.
//!
//! Engine components report through `MetricsSink`; hosts that want a
//! Prometheus scrape target pass `FacadeMetrics` to the engine and install
//! the recorder here once at startup.

use metrics::Unit;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use relay_core::telemetry;
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render the text exposition format. Fails if a
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Register descriptions for every engine metric with the current recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(telemetry::EVENTS_ROUTED, "Events stamped and handed to broadcast");
    metrics::describe_histogram!(
        telemetry::ROUTING_LATENCY_MS,
        Unit::Milliseconds,
        "Time from route entry to broadcast completion"
    );
    metrics::describe_counter!(
        telemetry::ISOLATION_VIOLATIONS,
        "Events rejected for addressing another user's resource"
    );
    metrics::describe_counter!(telemetry::FAILOVER_COUNT, "Primary to backup redirections");
    metrics::describe_counter!(telemetry::FAILOVER_RECOVERIES, "Primaries that came back");
    metrics::describe_counter!(telemetry::DELIVERY_FAILURES, "Escalated delivery failures");
    metrics::describe_counter!(telemetry::DELIVERY_RETRIES, "Send attempts after a timeout");
    metrics::describe_counter!(telemetry::EVENTS_BUFFERED, "Events held for offline users");
    metrics::describe_counter!(telemetry::EVENTS_DROPPED, "Events dropped or expired while offline");
    metrics::describe_counter!(telemetry::ORDERING_ANOMALIES, "Out-of-order events not sent");
    metrics::describe_counter!(telemetry::HEALTH_TRANSITIONS, "Connection status changes");
    metrics::describe_counter!(
        telemetry::STALE_RUN_REJECTIONS,
        "Emits rejected because their run already ended"
    );
    metrics::describe_counter!(telemetry::SESSIONS_CREATED, "Agent sessions created");
    metrics::describe_counter!(telemetry::SESSIONS_CLEANED, "Agent sessions cleaned up");
}
