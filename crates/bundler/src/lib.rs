//! Bundler loop: periodically flushes the mempool into `handleOps`
//! transactions.
//!
//! One logical bundling actor runs per replica set, gated by a
//! compare-and-set lock in the KV store. The lock's TTL bounds how long a
//! crashed holder can orphan it.

pub mod metrics;
pub mod service;

pub use metrics::BundlerMetrics;
pub use service::{Bundler, BundlerConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Key of the distributed bundling lock.
pub const BUNDLE_LOCK_KEY: &str = "bundle:lock";

/// Shared view of the loop's liveness, consumed by the status RPC.
#[derive(Debug, Clone, Default)]
pub struct BundlerHandle {
    running: Arc<AtomicBool>,
}

impl BundlerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}
