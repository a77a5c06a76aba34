//! Dependency health checks and the operator endpoints.

use std::sync::Arc;

use alloy_primitives::U256;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use opflow_cache::KvStore;
use opflow_datastore::UserOpStore;
use opflow_entrypoint::EntryPoint;
use serde::Serialize;
use serde_json::json;

use crate::RpcState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
    /// Reachable but below the configured threshold.
    Low,
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Check {
    fn up() -> Self {
        Self {
            status: CheckStatus::Up,
            detail: None,
        }
    }

    fn down(detail: String) -> Self {
        Self {
            status: CheckStatus::Down,
            detail: Some(detail),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChecks {
    pub database: Check,
    pub cache: Check,
    pub rpc: Check,
    pub bundler_balance: Check,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: OverallStatus,
    pub checks: HealthChecks,
}

/// Probes the service's dependencies. A dead store or cache makes the
/// service unhealthy; a dead EVM endpoint or an underfunded signer only
/// degrades it (ingress keeps accepting, bundling will fail loudly).
pub struct HealthService {
    store: Arc<dyn UserOpStore>,
    kv: Arc<dyn KvStore>,
    entry_point: Arc<dyn EntryPoint>,
    min_signer_balance: U256,
}

impl std::fmt::Debug for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthService")
            .field("min_signer_balance", &self.min_signer_balance)
            .finish_non_exhaustive()
    }
}

impl HealthService {
    pub fn new(
        store: Arc<dyn UserOpStore>,
        kv: Arc<dyn KvStore>,
        entry_point: Arc<dyn EntryPoint>,
        min_signer_balance: U256,
    ) -> Self {
        Self {
            store,
            kv,
            entry_point,
            min_signer_balance,
        }
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let database = match self.store.ping().await {
            Ok(()) => Check::up(),
            Err(e) => Check::down(e.to_string()),
        };
        let cache = match self.kv.ping().await {
            Ok(()) => Check::up(),
            Err(e) => Check::down(e.to_string()),
        };
        let rpc = match self.entry_point.block_number().await {
            Ok(_) => Check::up(),
            Err(e) => Check::down(e.to_string()),
        };
        let bundler_balance = match self.entry_point.signer_balance().await {
            Ok(balance) if balance >= self.min_signer_balance => Check::up(),
            Ok(balance) => Check {
                status: CheckStatus::Low,
                detail: Some(format!(
                    "signer balance {balance} below minimum {}",
                    self.min_signer_balance
                )),
            },
            Err(e) => Check::down(e.to_string()),
        };

        let status = if database.status == CheckStatus::Down || cache.status == CheckStatus::Down {
            OverallStatus::Unhealthy
        } else if rpc.status != CheckStatus::Up || bundler_balance.status != CheckStatus::Up {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthSnapshot {
            status,
            checks: HealthChecks {
                database,
                cache,
                rpc,
                bundler_balance,
            },
        }
    }
}

pub(crate) async fn health_handler(State(state): State<RpcState>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot().await)
}

pub(crate) async fn ready_handler(
    State(state): State<RpcState>,
) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = state.health.snapshot().await;
    let status = if snapshot.status == OverallStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(snapshot))
}

pub(crate) async fn live_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
