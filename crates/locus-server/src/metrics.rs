//! Metrics collection and export for Locus.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use locus_core::{DispatchReport, EngineStats};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SAMPLES_INGESTED: &str = "locus_samples_ingested_total";
    pub const SAMPLES_DISPATCHED: &str = "locus_samples_dispatched_total";
    pub const SAMPLES_THROTTLED: &str = "locus_samples_throttled_total";
    pub const REQUESTS_ACTIVE: &str = "locus_requests_active";
    pub const REQUESTS_REMOVED: &str = "locus_requests_removed_total";
    pub const SUBSCRIPTIONS_TOTAL: &str = "locus_subscriptions_total";
    pub const SUBSCRIBERS_ACTIVE: &str = "locus_subscribers_active";
    pub const SOURCES_RUNNING: &str = "locus_sources_running";
    pub const ERRORS_TOTAL: &str = "locus_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SAMPLES_INGESTED,
        "Raw samples emitted by location sources"
    );
    metrics::describe_counter!(
        names::SAMPLES_DISPATCHED,
        "Samples delivered to subscribers"
    );
    metrics::describe_counter!(
        names::SAMPLES_THROTTLED,
        "Samples suppressed by request policies"
    );
    metrics::describe_gauge!(names::REQUESTS_ACTIVE, "Current number of live requests");
    metrics::describe_counter!(
        names::REQUESTS_REMOVED,
        "Requests removed on completion, expiry or receiver death"
    );
    metrics::describe_counter!(names::SUBSCRIPTIONS_TOTAL, "Total number of subscriptions");
    metrics::describe_gauge!(
        names::SUBSCRIBERS_ACTIVE,
        "Current number of WebSocket subscribers"
    );
    metrics::describe_gauge!(names::SOURCES_RUNNING, "Location sources currently started");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record the outcome of one raw sample.
pub fn record_dispatch(provider: &str, report: &DispatchReport) {
    counter!(names::SAMPLES_INGESTED, "provider" => provider.to_string()).increment(1);
    counter!(names::SAMPLES_DISPATCHED).increment(report.delivered as u64);
    counter!(names::SAMPLES_THROTTLED).increment(report.throttled as u64);
    counter!(names::REQUESTS_REMOVED, "reason" => "dispatch").increment(report.removed as u64);
}

/// Record requests pruned by the verify loop.
pub fn record_pruned(count: usize) {
    counter!(names::REQUESTS_REMOVED, "reason" => "verify").increment(count as u64);
}

/// Publish engine gauges.
pub fn record_engine_stats(stats: &EngineStats) {
    gauge!(names::REQUESTS_ACTIVE).set(stats.request_count as f64);
    gauge!(names::SOURCES_RUNNING).set(stats.running_sources as f64);
}

/// Record a subscription.
pub fn record_subscription() {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that tracks a live subscriber.
pub struct SubscriberMetricsGuard;

impl SubscriberMetricsGuard {
    /// Create a new metrics guard, recording a subscriber.
    #[must_use]
    pub fn new() -> Self {
        gauge!(names::SUBSCRIBERS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SubscriberMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SubscriberMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SUBSCRIBERS_ACTIVE).decrement(1.0);
    }
}
