//! Prometheus recorder for the orchestrator's telemetry.
//!
//! Counters are emitted at their call sites (job lifecycle, webhook
//! notifier, API middleware); this module only installs the recorder
//! and sizes the histogram buckets to the two latency families this
//! service actually has. Default buckets top out at 10s, which would
//! flatten every media job into the last bucket.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Webhook deliveries: sub-second for healthy receivers, bounded by
/// the 30s request timeout.
const WEBHOOK_DELIVERY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Job turnaround, enqueue to terminal transition: seconds for small
/// caption work up to the 45-minute img2vid execution budget.
const JOB_TURNAROUND_BUCKETS: &[f64] = &[
    1.0, 5.0, 15.0, 60.0, 180.0, 600.0, 1200.0, 1800.0, 2700.0,
];

/// Install the global recorder and hand back the render handle for
/// the `/metrics` route. Call once per process.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("webhook_delivery_seconds".to_owned()),
            WEBHOOK_DELIVERY_BUCKETS,
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full("job_turnaround_seconds".to_owned()),
            JOB_TURNAROUND_BUCKETS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}
