use metrics::{Counter, Histogram};
use metrics_derive::Metrics;
use tokio::time::Duration;

/// `record_method_latency` lets us record with a per-method tag.
pub(crate) fn record_method_latency(latency: Duration, method: &str) {
    metrics::histogram!("opflow_rpc_method_latency", "method" => method.to_string())
        .record(latency.as_secs_f64());
}

/// Metrics for the RPC surface.
/// Conventions:
/// - Durations are recorded in seconds (histograms).
/// - Counters are monotonic event counts.
#[derive(Metrics, Clone)]
#[metrics(scope = "opflow_rpc")]
pub struct RpcMetrics {
    #[metric(describe = "Duration of a JSON-RPC request body")]
    pub request_duration: Histogram,

    #[metric(describe = "JSON-RPC calls served")]
    pub requests_total: Counter,

    #[metric(describe = "JSON-RPC calls that returned an error")]
    pub errors_total: Counter,

    #[metric(describe = "Requests rejected by the rate limiter")]
    pub rate_limited_total: Counter,
}
