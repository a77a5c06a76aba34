use metrics::{Counter, Histogram};
use metrics_derive::Metrics;

/// Metrics for the bundler loop.
/// Conventions:
/// - Durations are recorded in seconds (histograms).
/// - Counters are monotonic event counts.
#[derive(Metrics, Clone)]
#[metrics(scope = "opflow_bundler")]
pub struct BundlerMetrics {
    #[metric(describe = "Bundles submitted to the EntryPoint")]
    pub bundles_submitted_total: Counter,

    #[metric(describe = "Bundles confirmed on-chain")]
    pub bundles_confirmed_total: Counter,

    #[metric(describe = "Bundles that ended in failure")]
    pub bundles_failed_total: Counter,

    #[metric(describe = "User operations per submitted bundle")]
    pub ops_per_bundle: Histogram,

    #[metric(describe = "Duration of a bundler tick")]
    pub tick_duration: Histogram,
}
