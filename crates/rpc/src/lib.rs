//! HTTP surface of the bundler.
//!
//! A single axum router serves the JSON-RPC endpoint (`POST /rpc`, rate
//! limited) and the operator surface (`/health`, `/ready`, `/live`,
//! `/metrics`).

pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod rate_limit;

pub use error::{ErrorCode, RpcError};
pub use health::HealthService;
pub use metrics::RpcMetrics;
pub use rate_limit::RateLimiter;

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Router, http::StatusCode, middleware};
use metrics_exporter_prometheus::PrometheusHandle;
use opflow_bundler::BundlerHandle;
use opflow_datastore::BundleStore;
use opflow_entrypoint::EntryPoint;
use opflow_mempool::Mempool;

/// Shared state of all HTTP handlers. One instance is wired at startup.
#[derive(Clone)]
pub struct RpcState {
    pub mempool: Arc<Mempool>,
    pub bundles: Arc<dyn BundleStore>,
    pub entry_point: Arc<dyn EntryPoint>,
    pub bundler: BundlerHandle,
    pub health: Arc<HealthService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: RpcMetrics,
    pub prometheus: Option<PrometheusHandle>,
}

impl std::fmt::Debug for RpcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcState").finish_non_exhaustive()
    }
}

/// Build the service router. The rate limiter wraps only `/rpc`; the
/// operator endpoints stay reachable under load.
pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/rpc", post(dispatcher::handle_rpc))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_layer,
        ))
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::ready_handler))
        .route("/live", get(health::live_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<RpcState>) -> axum::response::Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not configured").into_response(),
    }
}
