//! Prometheus metrics for the engine bus.
//!
//! All metrics follow the naming convention: `engine_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., bus_messages_published_total)
//! - **Gauge**: Value that can go up or down (e.g., bus_pending_requests)
//! - **Histogram**: Distribution of values (e.g., bus_dispatch_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Registry all engine metrics are registered with
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // MESSAGE BROKER METRICS
    // =========================================================================

    /// Envelopes accepted by the broker, by message type
    pub static ref BUS_MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("engine_bus_messages_published_total", "Envelopes accepted by the broker"),
        &["message_type"]  // Publish/Request/Reply
    ).expect("metric creation failed");

    /// Handler invocations
    pub static ref BUS_MESSAGES_DELIVERED: Counter = Counter::new(
        "engine_bus_messages_delivered_total",
        "Total handler invocations performed by the broker"
    ).expect("metric creation failed");

    /// Request outcomes
    pub static ref BUS_REQUEST_OUTCOMES: CounterVec = CounterVec::new(
        Opts::new("engine_bus_request_outcomes_total", "Resolved requests by outcome"),
        &["outcome"]  // reply/timeout
    ).expect("metric creation failed");

    /// Replies that arrived with no pending request
    pub static ref BUS_STALE_REPLIES: Counter = Counter::new(
        "engine_bus_stale_replies_total",
        "Replies dropped because no matching request was pending"
    ).expect("metric creation failed");

    /// Envelopes rejected by schema validation
    pub static ref BUS_SCHEMA_FAILURES: Counter = Counter::new(
        "engine_bus_schema_failures_total",
        "Envelopes that failed schema validation"
    ).expect("metric creation failed");

    /// Requests waiting for a reply
    pub static ref BUS_PENDING_REQUESTS: Gauge = Gauge::new(
        "engine_bus_pending_requests",
        "Requests currently waiting for a reply or deadline"
    ).expect("metric creation failed");

    /// Time spent invoking handlers for one envelope
    pub static ref BUS_DISPATCH_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "engine_bus_dispatch_duration_seconds",
            "Time spent invoking all handlers for one envelope"
        ).buckets(exponential_buckets(0.00001, 2.0, 15).unwrap())
    ).expect("metric creation failed");

    // =========================================================================
    // LIFECYCLE METRICS
    // =========================================================================

    /// Lifecycle hook outcomes
    pub static ref SERVICE_TRANSITIONS: CounterVec = CounterVec::new(
        Opts::new("engine_service_transitions_total", "Lifecycle hook invocations"),
        &["phase", "outcome"]  // phase: register/post_register/start/stop, outcome: ok/failed/skipped
    ).expect("metric creation failed");

    /// Services currently started
    pub static ref SERVICES_STARTED: Gauge = Gauge::new(
        "engine_services_started",
        "Number of services in the Started state"
    ).expect("metric creation failed");

    // =========================================================================
    // NETWORK METRICS
    // =========================================================================

    /// Network status notifications
    pub static ref NETWORK_STATUS_CHANGED: CounterVec = CounterVec::new(
        Opts::new("engine_network_status_changed_total", "Network status change notifications"),
        &["status"]
    ).expect("metric creation failed");
}

/// Handle to the registered metrics.
pub struct MetricsHandle {
    registry: Arc<Registry>,
}

impl MetricsHandle {
    /// Encode every registered metric in Prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        encode_registry(&self.registry)
    }
}

/// Register all metrics with the engine registry.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Broker
        Box::new(BUS_MESSAGES_PUBLISHED.clone()),
        Box::new(BUS_MESSAGES_DELIVERED.clone()),
        Box::new(BUS_REQUEST_OUTCOMES.clone()),
        Box::new(BUS_STALE_REPLIES.clone()),
        Box::new(BUS_SCHEMA_FAILURES.clone()),
        Box::new(BUS_PENDING_REQUESTS.clone()),
        Box::new(BUS_DISPATCH_DURATION.clone()),
        // Lifecycle
        Box::new(SERVICE_TRANSITIONS.clone()),
        Box::new(SERVICES_STARTED.clone()),
        // Network
        Box::new(NETWORK_STATUS_CHANGED.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    encode_registry(&REGISTRY)
}

fn encode_registry(registry: &Registry) -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
