//! Metrics definitions for the SFU service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 2 values (registry, room)
//! - `kind`: 2 values (audio, video)
//! - `resource`: 3 values (transport, producer, consumer)
//! - `method`: bounded by signaling methods (~10 values, unknown methods
//!   are folded into `unknown`)
//! - `outcome`: 2 values (success, error)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling latency includes engine round-trips (transport creation, consume fan-out)
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 conversion is safe for realistic room counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of peers across all rooms.
///
/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

// ============================================================================
// Media Resource Metrics (Counters)
// ============================================================================

/// Record a producer being created.
///
/// Metric: `sfu_producers_created_total`
/// Labels: `kind` (audio, video)
pub fn record_producer_created(kind: &str) {
    counter!("sfu_producers_created_total", "kind" => kind.to_string()).increment(1);
}

/// Record a consumer being created (fan-out or catch-up).
///
/// Metric: `sfu_consumers_created_total`
pub fn record_consumer_created() {
    counter!("sfu_consumers_created_total").increment(1);
}

/// Record a resource that failed to close during cleanup.
///
/// Metric: `sfu_cleanup_failures_total`
/// Labels: `resource` (transport, producer, consumer)
///
/// Cleanup continues past failures; a rising rate points at the engine.
pub fn record_cleanup_failure(resource: &str) {
    counter!("sfu_cleanup_failures_total", "resource" => resource.to_string()).increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a handled signaling request.
///
/// Metric: `sfu_signaling_requests_total`
/// Labels: `method`, `outcome` (success, error)
pub fn record_signaling_request(method: &str, outcome: &str) {
    counter!("sfu_signaling_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record signaling request processing latency.
///
/// Metric: `sfu_signaling_latency_seconds`
/// Labels: `method`
pub fn record_signaling_latency(method: &str, duration: Duration) {
    histogram!("sfu_signaling_latency_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type` (registry, room)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}
