//! Admission, replacement, and eviction logic.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use opflow_cache::KvStore;
use opflow_core::{UserOpRecord, UserOpStatus, UserOperation};
use opflow_datastore::UserOpStore;
use opflow_entrypoint::{EntryPoint, EntryPointError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{MEMPOOL_INDEX_KEY, MempoolError, MempoolMetrics};

/// Tunables for admission and caching.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Admission stops once this many operations are cached.
    pub max_size: usize,
    /// TTL on `mempool:*` and `senderNonce:*` keys.
    pub ttl: Duration,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Result of an admission attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub hash: B256,
    pub status: UserOpStatus,
    /// Hash of the incumbent displaced by a fee-bump replacement.
    pub replaced: Option<B256>,
}

/// Cached pending operation. Cache entries exist only while the backing
/// row is pending, so no status field is carried.
#[derive(Debug, Serialize, Deserialize)]
struct CachedEntry {
    id: Uuid,
    hash: B256,
    user_op: UserOperation,
    submitted_at: DateTime<Utc>,
}

impl CachedEntry {
    fn into_record(self) -> UserOpRecord {
        UserOpRecord {
            id: self.id,
            hash: self.hash,
            user_op: self.user_op,
            status: UserOpStatus::Pending,
            bundle_id: None,
            transaction_hash: None,
            block_number: None,
            error: None,
            submitted_at: self.submitted_at,
        }
    }
}

fn mempool_key(hash: B256) -> String {
    format!("mempool:{hash:#x}")
}

fn sender_nonce_key(sender: Address, nonce: U256) -> String {
    format!("senderNonce:{sender:#x}:{nonce}")
}

/// The candidate must bump the priority fee by >= 10% (integer math,
/// multiply before divide) without lowering the fee cap.
fn replacement_priced(incumbent: &UserOperation, candidate: &UserOperation) -> bool {
    let floor = incumbent
        .max_priority_fee_per_gas
        .checked_mul(U256::from(110))
        .map_or(U256::MAX, |scaled| scaled / U256::from(100));
    candidate.max_priority_fee_per_gas >= floor
        && candidate.max_fee_per_gas >= incumbent.max_fee_per_gas
}

/// Mempool over the durable store, the KV cache, and the EntryPoint
/// adapter. One instance is built at startup and shared by the RPC layer
/// and the bundler loop.
pub struct Mempool {
    store: Arc<dyn UserOpStore>,
    kv: Arc<dyn KvStore>,
    entry_point: Arc<dyn EntryPoint>,
    config: MempoolConfig,
    metrics: MempoolMetrics,
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Mempool {
    pub fn new(
        store: Arc<dyn UserOpStore>,
        kv: Arc<dyn KvStore>,
        entry_point: Arc<dyn EntryPoint>,
        config: MempoolConfig,
    ) -> Self {
        Self {
            store,
            kv,
            entry_point,
            config,
            metrics: MempoolMetrics::default(),
        }
    }

    /// Validate, deduplicate, possibly replace, persist, and cache a user
    /// operation. Re-admitting a known operation is idempotent and returns
    /// the existing record's state.
    pub async fn admit(&self, op: UserOperation) -> Result<Admission, MempoolError> {
        let hash = op.hash(self.entry_point.address(), self.entry_point.chain_id());

        if let Some(existing) = self.store.find_by_hash(hash).await? {
            debug!(hash = %hash, status = existing.status.as_str(), "duplicate admission");
            return Ok(Admission {
                hash,
                status: existing.status,
                replaced: None,
            });
        }

        let size = self.size().await?;
        if size >= self.config.max_size {
            self.metrics.rejected_total.increment(1);
            return Err(MempoolError::Full {
                size,
                max: self.config.max_size,
            });
        }

        let conflict_key = sender_nonce_key(op.sender, op.nonce);
        let mut replaced = None;
        if let Some(incumbent_hash) = self.kv.get(&conflict_key).await? {
            match self.pending_by_hash_text(&incumbent_hash).await? {
                Some(incumbent) => {
                    if !replacement_priced(&incumbent.user_op, &op) {
                        self.metrics.rejected_total.increment(1);
                        return Err(MempoolError::ReplacementUnderpriced);
                    }
                    self.evict(&incumbent).await?;
                    self.store.mark_removed(incumbent.hash).await?;
                    self.metrics.replaced_total.increment(1);
                    info!(
                        incumbent = %incumbent.hash,
                        replacement = %hash,
                        sender = %op.sender,
                        nonce = %op.nonce,
                        "replaced user operation"
                    );
                    replaced = Some(incumbent.hash);
                }
                // Stale index entry; the store has no pending row behind
                // it, so the candidate may take the slot.
                None => debug!(key = %conflict_key, "stale senderNonce entry"),
            }
        }

        let outcome = self
            .entry_point
            .simulate_validation(&op)
            .await
            .map_err(admission_error)?;
        if outcome.signature_failed {
            self.metrics.rejected_total.increment(1);
            return Err(MempoolError::Validation(
                "signature verification failed".to_string(),
            ));
        }

        let record = UserOpRecord::admitted(hash, op);
        self.store.insert(&record).await?;
        self.cache_record(&record).await?;

        self.metrics.admitted_total.increment(1);
        info!(
            hash = %hash,
            sender = %record.user_op.sender,
            nonce = %record.user_op.nonce,
            "admitted user operation"
        );
        Ok(Admission {
            hash,
            status: record.status,
            replaced,
        })
    }

    /// Cache-first lookup, falling through to the durable store.
    pub async fn get(&self, hash: B256) -> Result<Option<UserOpRecord>, MempoolError> {
        if let Some(text) = self.kv.get(&mempool_key(hash)).await? {
            match serde_json::from_str::<CachedEntry>(&text) {
                Ok(entry) => return Ok(Some(entry.into_record())),
                Err(e) => warn!(hash = %hash, error = %e, "corrupt cache entry, falling through"),
            }
        }
        Ok(self.store.find_by_hash(hash).await?)
    }

    /// Pending operations, oldest admission first (FIFO across senders).
    pub async fn pending(&self, limit: usize) -> Result<Vec<UserOpRecord>, MempoolError> {
        Ok(self.store.pending(limit as u32).await?)
    }

    /// Evict from the cache and mark the durable row removed (located by
    /// hash). Returns whether a pending row was transitioned.
    pub async fn remove(&self, hash: B256) -> Result<bool, MempoolError> {
        match self.store.find_by_hash(hash).await? {
            Some(record) => self.evict(&record).await?,
            None => {
                // No row to cross-check; clear whatever the cache holds.
                self.kv.del(&mempool_key(hash)).await?;
                self.kv.zrem(MEMPOOL_INDEX_KEY, &format!("{hash:#x}")).await?;
            }
        }
        Ok(self.store.mark_removed(hash).await?)
    }

    /// Number of cached user operations (`mempool:*` keys).
    pub async fn size(&self) -> Result<usize, MempoolError> {
        let size = self.kv.keys("mempool:*").await?.len();
        self.metrics.size.set(size as f64);
        Ok(size)
    }

    /// Admin-only cache purge. Durable rows are untouched.
    pub async fn clear(&self) -> Result<usize, MempoolError> {
        let mut cleared = 0;
        for key in self.kv.keys("mempool:*").await? {
            if self.kv.del(&key).await? {
                cleared += 1;
            }
        }
        for key in self.kv.keys("senderNonce:*").await? {
            self.kv.del(&key).await?;
        }
        self.kv.del(MEMPOOL_INDEX_KEY).await?;
        self.metrics.size.set(0.0);
        info!(cleared, "cleared mempool cache");
        Ok(cleared)
    }

    /// Drop cache entries whose backing row is missing or no longer
    /// pending. Runs periodically; also repairs index entries left behind
    /// by TTL expiry.
    pub async fn sweep(&self) -> Result<usize, MempoolError> {
        let mut evicted = 0;
        for member in self.kv.zrange(MEMPOOL_INDEX_KEY, 0, -1).await? {
            let Ok(hash) = member.parse::<B256>() else {
                self.kv.zrem(MEMPOOL_INDEX_KEY, &member).await?;
                continue;
            };
            let row = self.store.find_by_hash(hash).await?;
            let stale = match &row {
                Some(record) => record.status != UserOpStatus::Pending,
                None => true,
            };
            if stale {
                match row {
                    Some(record) => self.evict(&record).await?,
                    None => {
                        self.kv.del(&mempool_key(hash)).await?;
                        self.kv.zrem(MEMPOOL_INDEX_KEY, &member).await?;
                    }
                }
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "swept stale cache entries");
        }
        Ok(evicted)
    }

    /// Periodic sweeper task; exits when `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "cache sweep failed");
            }
        }
    }

    /// Remove an operation's cache entries without touching the durable
    /// row. Used when it leaves the pending state (submitted, failed,
    /// replaced, removed).
    pub async fn evict(&self, record: &UserOpRecord) -> Result<(), MempoolError> {
        self.kv.del(&mempool_key(record.hash)).await?;
        self.kv
            .zrem(MEMPOOL_INDEX_KEY, &format!("{:#x}", record.hash))
            .await?;

        // Only drop the sender/nonce index if it still points at this
        // operation; a replacement may already have taken the slot.
        let conflict_key = sender_nonce_key(record.user_op.sender, record.user_op.nonce);
        if let Some(current) = self.kv.get(&conflict_key).await?
            && current == format!("{:#x}", record.hash)
        {
            self.kv.del(&conflict_key).await?;
        }
        self.metrics.evicted_total.increment(1);
        Ok(())
    }

    async fn pending_by_hash_text(
        &self,
        hash_text: &str,
    ) -> Result<Option<UserOpRecord>, MempoolError> {
        let Ok(hash) = hash_text.parse::<B256>() else {
            return Ok(None);
        };
        let record = self.store.find_by_hash(hash).await?;
        Ok(record.filter(|r| r.status == UserOpStatus::Pending))
    }

    async fn cache_record(&self, record: &UserOpRecord) -> Result<(), MempoolError> {
        let entry = CachedEntry {
            id: record.id,
            hash: record.hash,
            user_op: record.user_op.clone(),
            submitted_at: record.submitted_at,
        };
        let hash_text = format!("{:#x}", record.hash);

        self.kv
            .set_ex(
                &mempool_key(record.hash),
                &serde_json::to_string(&entry)?,
                self.config.ttl,
            )
            .await?;
        self.kv
            .set_ex(
                &sender_nonce_key(record.user_op.sender, record.user_op.nonce),
                &hash_text,
                self.config.ttl,
            )
            .await?;
        self.kv
            .zadd(
                MEMPOOL_INDEX_KEY,
                &hash_text,
                record.submitted_at.timestamp_millis() as f64,
            )
            .await?;
        Ok(())
    }
}

fn admission_error(error: EntryPointError) -> MempoolError {
    match error {
        EntryPointError::ValidationRevert { reason } => MempoolError::Validation(reason),
        EntryPointError::SimulationFailed(message) => MempoolError::Validation(message),
        EntryPointError::Rpc(message) => MempoolError::EntryPoint(message),
    }
}
