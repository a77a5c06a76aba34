//! Validated mempool: the single source of truth for which user
//! operations are candidates for inclusion.
//!
//! The durable store is authoritative; the Redis cache is a TTL'd index
//! for hot hash lookups and sender/nonce conflict detection. Divergence is
//! resolved in favor of the store, lazily on reads and periodically by the
//! sweeper.

pub mod metrics;
pub mod pool;

pub use metrics::MempoolMetrics;
pub use pool::{Admission, Mempool, MempoolConfig};

use opflow_cache::KvError;
use opflow_datastore::StoreError;

/// Sorted set indexing cached user operations by admission time
/// (epoch milliseconds). Deliberately outside the `mempool:*` namespace so
/// that key counts under that prefix stay exact.
pub const MEMPOOL_INDEX_KEY: &str = "mempoolIndex";

/// Errors surfaced by mempool operations.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("mempool is full ({size}/{max})")]
    Full { size: usize, max: usize },
    #[error(
        "replacement underpriced: maxPriorityFeePerGas must be bumped \
         by at least 10% without lowering maxFeePerGas"
    )]
    ReplacementUnderpriced,
    #[error("user operation validation failed: {0}")]
    Validation(String),
    #[error("entrypoint unavailable: {0}")]
    EntryPoint(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] KvError),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}
