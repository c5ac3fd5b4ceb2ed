//! Metrics seam.
//!
//! Components report through [`MetricsSink::record_metric`] so the host decides
//! where numbers go. [`FacadeMetrics`] forwards to the `metrics` crate facade
//! (and from there to whatever recorder is installed, e.g. Prometheus);
//! [`InMemoryMetrics`] keeps samples for assertions.

use parking_lot::Mutex;

// Metric name constants to avoid typos across crates.

/// Events accepted by the router (counter, tags: `user_id`).
pub const EVENTS_ROUTED: &str = "events_routed";
/// Time from `route` entry to fan-out completion (histogram, milliseconds, tags: `user_id`).
pub const ROUTING_LATENCY_MS: &str = "routing_latency_ms";
/// Isolation violations detected (counter, tags: `user_id`).
pub const ISOLATION_VIOLATIONS: &str = "isolation_violations_count";
/// Failovers from a primary to a backup (counter, tags: `user_id`).
pub const FAILOVER_COUNT: &str = "failover_count";
/// Primaries that recovered and took delivery back (counter, tags: `user_id`).
pub const FAILOVER_RECOVERIES: &str = "failover_recoveries";
/// Per-connection delivery failures (counter, tags: `category`).
pub const DELIVERY_FAILURES: &str = "delivery_failures";
/// Send attempts repeated after a timeout (counter, tags: `connection_id`).
pub const DELIVERY_RETRIES: &str = "delivery_retries";
/// Events held for an offline user (counter, tags: `user_id`).
pub const EVENTS_BUFFERED: &str = "events_buffered";
/// Events discarded, evicted or expired while the user was offline (counter, tags: `user_id`).
pub const EVENTS_DROPPED: &str = "events_dropped";
/// Events rejected for breaking per-thread order (counter, tags: `user_id`).
pub const ORDERING_ANOMALIES: &str = "ordering_anomalies";
/// Connection health changes (counter, tags: `from`, `to`).
pub const HEALTH_TRANSITIONS: &str = "connection_health_transitions";
/// Events rejected because their run already ended (counter, tags: `user_id`).
pub const STALE_RUN_REJECTIONS: &str = "stale_run_rejections";
/// Agent sessions created (counter, tags: `user_id`).
pub const SESSIONS_CREATED: &str = "sessions_created";
/// Agent sessions cleaned up (counter, tags: `user_id`).
pub const SESSIONS_CLEANED: &str = "sessions_cleaned";

/// Destination for engine metrics.
pub trait MetricsSink: Send + Sync {
    /// Record one observation. Counters receive increments, `*_ms` names
    /// receive latency samples.
    fn record_metric(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]);

    /// Shorthand for a counter increment of one.
    fn increment(&self, name: &'static str, tags: &[(&'static str, String)]) {
        self.record_metric(name, 1.0, tags);
    }
}

/// Forwards to the global `metrics` recorder.
#[derive(Clone, Copy, Debug, Default)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn record_metric(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]) {
        let labels: Vec<metrics::Label> = tags
            .iter()
            .map(|(k, v)| metrics::Label::new(*k, v.clone()))
            .collect();
        if name.ends_with("_ms") {
            metrics::histogram!(name, labels).record(value);
        } else {
            metrics::counter!(name, labels).increment(value as u64);
        }
    }
}

/// One recorded observation.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Metric name.
    pub name: &'static str,
    /// Observed value.
    pub value: f64,
    /// Tags attached to the observation.
    pub tags: Vec<(&'static str, String)>,
}

/// Keeps every sample in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    samples: Mutex<Vec<MetricSample>>,
}

impl InMemoryMetrics {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all values recorded under `name`.
    pub fn total(&self, name: &str) -> f64 {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .sum()
    }

    /// Number of samples recorded under `name`.
    pub fn count(&self, name: &str) -> usize {
        self.samples.lock().iter().filter(|s| s.name == name).count()
    }

    /// Samples recorded under `name`, oldest first.
    pub fn samples(&self, name: &str) -> Vec<MetricSample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Mean of samples recorded under `name`, or `None` if there are none.
    pub fn mean(&self, name: &str) -> Option<f64> {
        let n = self.count(name);
        (n > 0).then(|| self.total(name) / n as f64)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_metric(&self, name: &'static str, value: f64, tags: &[(&'static str, String)]) {
        self.samples.lock().push(MetricSample {
            name,
            value,
            tags: tags.to_vec(),
        });
    }
}
