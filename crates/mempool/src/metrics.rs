use metrics::{Counter, Gauge};
use metrics_derive::Metrics;

/// Metrics for the mempool.
/// Conventions:
/// - Counters are monotonic event counts.
/// - Gauges reflect the current value/state.
#[derive(Metrics, Clone)]
#[metrics(scope = "opflow_mempool")]
pub struct MempoolMetrics {
    #[metric(describe = "User operations admitted")]
    pub admitted_total: Counter,

    #[metric(describe = "Fee-bump replacements applied")]
    pub replaced_total: Counter,

    #[metric(describe = "Admissions rejected")]
    pub rejected_total: Counter,

    #[metric(describe = "Cache entries evicted")]
    pub evicted_total: Counter,

    #[metric(describe = "Pending user operations currently cached")]
    pub size: Gauge,
}
