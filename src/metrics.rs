//! Prometheus metrics for subscription dispatchers.
//!
//! All metrics live in a custom registry with the "pulsaresque" prefix so
//! they never collide with an embedding application's default registry.
//! Registration failures are logged and an unregistered metric is returned
//! instead of panicking.
//!
//! Labels are `subscription` (the subscription name) and `sub_type`
//! (`Exclusive`, `Failover`, `Shared`, `Key_Shared`) unless noted.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for dispatcher metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("pulsaresque".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// Each macro expands to a Lazy static registered through the safe helpers below:
//
//   define_gauge_vec!(MY_GAUGE, "my_metric", "Description", ["label1"]);
//   define_counter_vec!(MY_COUNTER, "my_metric", "Description", ["label1"]);
//   define_histogram_vec!(MY_HISTOGRAM, "my_metric", "Description", ["label"],
//       [0.001, 0.01, 0.1, 1.0]);

macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Dispatch throughput
// =============================================================================

define_counter_vec!(
    MESSAGES_DISPATCHED,
    "messages_dispatched_total",
    "Total number of entries handed to consumers",
    ["subscription", "sub_type"]
);
define_counter_vec!(
    BYTES_DISPATCHED,
    "bytes_dispatched_total",
    "Total payload bytes handed to consumers",
    ["subscription", "sub_type"]
);
define_histogram_vec!(
    DISPATCH_ROUND_DURATION,
    "dispatch_round_duration_seconds",
    "Duration of one dispatch cycle in seconds",
    ["sub_type"],
    [0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
);

// =============================================================================
// Consumers and backlog
// =============================================================================

define_gauge_vec!(
    CONNECTED_CONSUMERS,
    "connected_consumers",
    "Number of consumers attached to a dispatcher",
    ["subscription"]
);
define_counter_vec!(
    CONSUMER_EVENTS,
    "consumer_events_total",
    "Consumer lifecycle events (added, removed, rejected, active_changed)",
    ["sub_type", "event"]
);
define_gauge_vec!(
    UNACKED_MESSAGES,
    "unacked_messages",
    "Entries dispatched but not yet acknowledged",
    ["subscription"]
);
define_gauge_vec!(
    DELAYED_MESSAGES,
    "delayed_messages",
    "Entries held back until their delivery time",
    ["subscription"]
);

// =============================================================================
// Redelivery, throttling and filtering
// =============================================================================

define_counter_vec!(
    REDELIVERIES,
    "redeliveries_total",
    "Entries scheduled for redelivery, by reason",
    ["subscription", "reason"]
);
define_counter_vec!(
    DISPATCH_THROTTLED,
    "dispatch_throttled_total",
    "Dispatch attempts denied by the rate limiter",
    ["subscription"]
);
define_counter_vec!(
    FILTER_RESULTS,
    "filter_results_total",
    "Entry filter outcomes (accepted, rejected, rescheduled)",
    ["subscription", "result"]
);

// =============================================================================
// Health
// =============================================================================

define_counter_vec!(
    STUCK_CHECKS,
    "stuck_checks_total",
    "Stuck-dispatch checks, by outcome (blocked, unblocked, still_stuck)",
    ["subscription", "outcome"]
);
define_counter_vec!(
    STATE_TRANSITIONS,
    "state_transitions_total",
    "Dispatcher lifecycle transitions (closing, closed, reset)",
    ["sub_type", "state"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts of collaborator calls, by policy and outcome",
    ["policy", "outcome"]
);

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric. Idempotent.
pub fn init_metrics() {
    let _ = &*MESSAGES_DISPATCHED;
    let _ = &*BYTES_DISPATCHED;
    let _ = &*DISPATCH_ROUND_DURATION;
    let _ = &*CONNECTED_CONSUMERS;
    let _ = &*CONSUMER_EVENTS;
    let _ = &*UNACKED_MESSAGES;
    let _ = &*DELAYED_MESSAGES;
    let _ = &*REDELIVERIES;
    let _ = &*DISPATCH_THROTTLED;
    let _ = &*FILTER_RESULTS;
    let _ = &*STUCK_CHECKS;
    let _ = &*STATE_TRANSITIONS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Record entries handed to one consumer in a dispatch round.
pub fn record_dispatch(subscription: &str, sub_type: &str, messages: u64, bytes: u64) {
    MESSAGES_DISPATCHED
        .with_label_values(&[subscription, sub_type])
        .inc_by(messages);
    BYTES_DISPATCHED
        .with_label_values(&[subscription, sub_type])
        .inc_by(bytes);
}

/// Record entries put back for redelivery.
pub fn record_redelivery(subscription: &str, reason: &str, count: u64) {
    if count > 0 {
        REDELIVERIES
            .with_label_values(&[subscription, reason])
            .inc_by(count);
    }
}

pub fn record_consumer_event(sub_type: &str, event: &str) {
    CONSUMER_EVENTS.with_label_values(&[sub_type, event]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefix() {
        init_metrics();
        record_dispatch("metrics-test-sub", "Shared", 3, 30);
        let text = encode_metrics().unwrap();
        assert!(text.contains("pulsaresque_messages_dispatched_total"));
        assert!(text.contains("metrics-test-sub"));
    }

    #[test]
    fn test_zero_redelivery_not_recorded() {
        record_redelivery("metrics-zero-sub", "nack", 0);
        let value = REDELIVERIES
            .with_label_values(&["metrics-zero-sub", "nack"])
            .get();
        assert_eq!(value, 0);
    }

    #[test]
    fn test_gather_returns_families() {
        init_metrics();
        record_consumer_event("Exclusive", "added");
        assert!(!gather_metrics().is_empty());
    }
}
