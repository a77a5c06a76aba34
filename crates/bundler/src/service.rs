//! Per-tick bundling: lock, select, submit, attribute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256};
use anyhow::anyhow;
use backon::{ExponentialBuilder, Retryable};
use opflow_cache::KvStore;
use opflow_core::{BundleRecord, UserOpRecord, UserOperation};
use opflow_datastore::{BundleStore, UserOpStore};
use opflow_entrypoint::{EntryPoint, EntryPointError, FeeData, TxOverrides};
use opflow_mempool::Mempool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{BUNDLE_LOCK_KEY, BundlerHandle, BundlerMetrics};

/// Tunables for the bundling loop.
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    /// Tick period.
    pub interval: Duration,
    pub max_ops_per_bundle: usize,
    /// Hard cap on the bundle transaction's gas limit.
    pub max_bundle_gas: u64,
    /// How long to wait for the bundle receipt before attributing failure.
    pub tx_timeout: Duration,
    /// TTL on `bundle:lock`; bounds orphaned locks after a crash.
    pub lock_ttl: Duration,
    /// Fee recipient passed to `handleOps`.
    pub beneficiary: Address,
    /// Percent added to the provider's fee data.
    pub fee_bump_percent: u64,
    /// Percent added to the estimated bundle gas limit.
    pub gas_buffer_percent: u64,
}

impl BundlerConfig {
    /// Production defaults, with the given beneficiary.
    pub fn with_beneficiary(beneficiary: Address) -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_ops_per_bundle: 10,
            max_bundle_gas: 10_000_000,
            tx_timeout: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(30),
            beneficiary,
            fee_bump_percent: 20,
            gas_buffer_percent: 20,
        }
    }
}

/// `sum(verificationGasLimit + callGasLimit) + 21000 per op`, padded by the
/// buffer and capped at the bundle maximum.
fn bundle_gas_limit(ops: &[UserOpRecord], max_bundle_gas: u64, buffer_percent: u64) -> u64 {
    let op_gas = ops.iter().fold(0u64, |acc, record| {
        let per_op = record
            .user_op
            .verification_gas_limit
            .saturating_add(record.user_op.call_gas_limit);
        acc.saturating_add(u64::try_from(per_op).unwrap_or(u64::MAX))
    });
    let estimate = op_gas.saturating_add(21_000u64.saturating_mul(ops.len() as u64));
    let padded = estimate.saturating_mul(100 + buffer_percent) / 100;
    padded.min(max_bundle_gas)
}

fn bumped_fees(fees: FeeData, bump_percent: u64) -> (u128, u128) {
    let bump = u128::from(100 + bump_percent);
    (
        fees.max_fee_per_gas.saturating_mul(bump) / 100,
        fees.max_priority_fee_per_gas.saturating_mul(bump) / 100,
    )
}

/// Bundle/op error columns are capped at 255 characters.
fn truncate_error(message: &str) -> String {
    message.chars().take(255).collect()
}

/// The bundling actor. `run` drives ticks until shutdown; a tick is also
/// callable directly for tests.
pub struct Bundler {
    mempool: Arc<Mempool>,
    user_ops: Arc<dyn UserOpStore>,
    bundles: Arc<dyn BundleStore>,
    kv: Arc<dyn KvStore>,
    entry_point: Arc<dyn EntryPoint>,
    config: BundlerConfig,
    handle: BundlerHandle,
    metrics: BundlerMetrics,
}

impl std::fmt::Debug for Bundler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bundler {
    pub fn new(
        mempool: Arc<Mempool>,
        user_ops: Arc<dyn UserOpStore>,
        bundles: Arc<dyn BundleStore>,
        kv: Arc<dyn KvStore>,
        entry_point: Arc<dyn EntryPoint>,
        config: BundlerConfig,
    ) -> Self {
        Self {
            mempool,
            user_ops,
            bundles,
            kv,
            entry_point,
            config,
            handle: BundlerHandle::new(),
            metrics: BundlerMetrics::default(),
        }
    }

    /// Liveness handle for the status RPC.
    pub fn handle(&self) -> BundlerHandle {
        self.handle.clone()
    }

    /// Tick until `shutdown` fires. A tick in flight completes before the
    /// loop exits, so an in-flight bundle is awaited up to `tx_timeout`.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.handle.set_running(true);
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval.as_millis() as u64, "bundler loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let started = Instant::now();
            // A failed bundle is recorded and the loop moves on; only the
            // tick's own bookkeeping errors land here.
            if let Err(e) = self.tick().await {
                error!(error = %e, "bundler tick failed");
            }
            self.metrics.tick_duration.record(started.elapsed().as_secs_f64());
        }

        self.handle.set_running(false);
        info!("bundler loop stopped");
    }

    /// One bundling attempt. Returns the bundle id if one was created.
    pub async fn tick(&self) -> anyhow::Result<Option<Uuid>> {
        let token = Uuid::new_v4().to_string();
        if !self
            .kv
            .set_nx_ex(BUNDLE_LOCK_KEY, &token, self.config.lock_ttl)
            .await?
        {
            debug!("bundle lock held elsewhere, skipping tick");
            return Ok(None);
        }

        let result = self.flush().await;
        self.release_lock(&token).await;
        result
    }

    async fn release_lock(&self, token: &str) {
        // Only the holder releases; anyone else's lock expires via TTL.
        match self.kv.get(BUNDLE_LOCK_KEY).await {
            Ok(Some(current)) if current == token => {
                if let Err(e) = self.kv.del(BUNDLE_LOCK_KEY).await {
                    warn!(error = %e, "failed to release bundle lock");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read bundle lock for release"),
        }
    }

    async fn flush(&self) -> anyhow::Result<Option<Uuid>> {
        let ops = self.mempool.pending(self.config.max_ops_per_bundle).await?;
        if ops.is_empty() {
            return Ok(None);
        }

        let bundle = BundleRecord::created();
        self.bundles.insert(&bundle).await?;
        let hashes: Vec<B256> = ops.iter().map(|r| r.hash).collect();
        self.user_ops.assign_bundle(&hashes, bundle.id).await?;
        info!(bundle_id = %bundle.id, ops = ops.len(), "created bundle");

        match self.submit(bundle.id, &ops).await {
            Ok(block_number) => {
                self.metrics.bundles_confirmed_total.increment(1);
                info!(bundle_id = %bundle.id, block_number, "bundle confirmed");
            }
            Err(e) => {
                let message = truncate_error(&e.to_string());
                self.metrics.bundles_failed_total.increment(1);
                error!(bundle_id = %bundle.id, error = %message, "bundle failed");

                self.bundles.mark_failed(bundle.id, &message).await?;
                self.user_ops.mark_ops_failed(bundle.id, &message).await?;
                // Failed ops do not retry; clients must resubmit.
                for op in &ops {
                    if let Err(evict_err) = self.mempool.evict(op).await {
                        warn!(hash = %op.hash, error = %evict_err, "failed to evict user operation");
                    }
                }
            }
        }
        Ok(Some(bundle.id))
    }

    async fn submit(&self, bundle_id: Uuid, ops: &[UserOpRecord]) -> anyhow::Result<u64> {
        let gas_limit = bundle_gas_limit(ops, self.config.max_bundle_gas, self.config.gas_buffer_percent);
        let fees = self.entry_point.fee_data().await?;
        let (max_fee_per_gas, max_priority_fee_per_gas) =
            bumped_fees(fees, self.config.fee_bump_percent);
        let overrides = TxOverrides {
            max_fee_per_gas,
            max_priority_fee_per_gas,
            gas_limit,
        };

        // Submitted in admission order; the EntryPoint enforces per-sender
        // nonce order at execution time.
        let user_ops: Vec<UserOperation> = ops.iter().map(|r| r.user_op.clone()).collect();
        let submit = || async {
            self.entry_point
                .handle_ops(&user_ops, self.config.beneficiary, overrides)
                .await
        };
        let transaction_hash = submit
            .retry(
                &ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(100))
                    .with_max_delay(Duration::from_secs(2))
                    .with_max_times(3),
            )
            .when(EntryPointError::is_transient)
            .await?;

        self.bundles.mark_submitted(bundle_id, transaction_hash).await?;
        self.user_ops
            .mark_ops_submitted(bundle_id, transaction_hash)
            .await?;
        // The cache only holds pending ops.
        for op in ops {
            if let Err(e) = self.mempool.evict(op).await {
                warn!(hash = %op.hash, error = %e, "failed to evict user operation");
            }
        }
        self.metrics.bundles_submitted_total.increment(1);
        self.metrics.ops_per_bundle.record(ops.len() as f64);
        info!(bundle_id = %bundle_id, tx_hash = %transaction_hash, gas_limit, "bundle submitted");

        match self
            .entry_point
            .wait_for_receipt(transaction_hash, self.config.tx_timeout)
            .await?
        {
            Some(receipt) if receipt.success => {
                self.bundles
                    .mark_confirmed(bundle_id, receipt.block_number)
                    .await?;
                self.user_ops
                    .mark_ops_confirmed(bundle_id, receipt.block_number)
                    .await?;
                Ok(receipt.block_number)
            }
            Some(receipt) => Err(anyhow!(
                "bundle transaction reverted in block {}",
                receipt.block_number
            )),
            None => Err(anyhow!(
                "transaction receipt not found within {}s; it may still confirm later",
                self.config.tx_timeout.as_secs()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{U256, address};
    use opflow_cache::MemoryKvStore;
    use opflow_core::test_utils::test_user_op;
    use opflow_core::{BundleStatus, UserOpStatus};
    use opflow_datastore::MemoryDatastore;
    use opflow_entrypoint::MockEntryPoint;
    use opflow_entrypoint::mock::ReceiptMode;
    use opflow_mempool::{Mempool, MempoolConfig};

    const ENTRY_POINT: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
    const SENDER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    const BENEFICIARY: Address = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

    struct Harness {
        bundler: Bundler,
        mempool: Arc<Mempool>,
        store: Arc<MemoryDatastore>,
        kv: Arc<MemoryKvStore>,
        entry_point: Arc<MockEntryPoint>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryDatastore::new());
        let kv = Arc::new(MemoryKvStore::new());
        let entry_point = Arc::new(MockEntryPoint::new(ENTRY_POINT, 31337));
        let mempool = Arc::new(Mempool::new(
            store.clone(),
            kv.clone(),
            entry_point.clone(),
            MempoolConfig::default(),
        ));
        let bundler = Bundler::new(
            mempool.clone(),
            store.clone(),
            store.clone(),
            kv.clone(),
            entry_point.clone(),
            BundlerConfig {
                tx_timeout: Duration::from_secs(1),
                ..BundlerConfig::with_beneficiary(BENEFICIARY)
            },
        );
        Harness {
            bundler,
            mempool,
            store,
            kv,
            entry_point,
        }
    }

    #[tokio::test]
    async fn tick_without_pending_ops_creates_no_bundle() {
        let h = harness();
        assert_eq!(h.bundler.tick().await.unwrap(), None);
        assert!(h.store.bundle_rows().is_empty());
        // Lock released even on the empty path.
        assert!(h.kv.get(BUNDLE_LOCK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tick_skips_when_lock_is_held() {
        let h = harness();
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.kv.set_nx_ex(BUNDLE_LOCK_KEY, "another-worker", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(h.bundler.tick().await.unwrap(), None);
        assert!(h.entry_point.submissions().is_empty());
        // The foreign lock is left alone.
        assert_eq!(
            h.kv.get(BUNDLE_LOCK_KEY).await.unwrap().as_deref(),
            Some("another-worker")
        );
    }

    #[tokio::test]
    async fn happy_path_confirms_bundle_and_ops() {
        let h = harness();
        let a = h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        let b = h.mempool.admit(test_user_op(SENDER, 1)).await.unwrap();
        h.entry_point
            .set_receipt_mode(ReceiptMode::Confirm { block_number: 1234 });

        let bundle_id = h.bundler.tick().await.unwrap().expect("bundle created");

        let bundle = BundleStore::get(h.store.as_ref(), bundle_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.status, BundleStatus::Confirmed);
        assert_eq!(bundle.block_number, Some(1234));
        assert!(bundle.transaction_hash.is_some());

        for hash in [a.hash, b.hash] {
            let row = h.store.find_by_hash(hash).await.unwrap().unwrap();
            assert_eq!(row.status, UserOpStatus::Confirmed);
            assert_eq!(row.block_number, Some(1234));
            assert_eq!(row.bundle_id, Some(bundle_id));
        }

        // Ops left the cache at submission time, lock was released.
        assert_eq!(h.mempool.size().await.unwrap(), 0);
        assert!(h.kv.get(BUNDLE_LOCK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ops_are_submitted_in_admission_order() {
        let h = harness();
        let other = address!("3C44CdDdB6a900fa2b585dd299e03d12FA4293BC");
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.mempool.admit(test_user_op(other, 0)).await.unwrap();
        h.mempool.admit(test_user_op(SENDER, 1)).await.unwrap();

        h.bundler.tick().await.unwrap();

        let submissions = h.entry_point.submissions();
        assert_eq!(submissions.len(), 1);
        let ops = &submissions[0].ops;
        assert_eq!(ops.len(), 3);
        assert_eq!((ops[0].sender, ops[0].nonce), (SENDER, U256::ZERO));
        assert_eq!((ops[1].sender, ops[1].nonce), (other, U256::ZERO));
        assert_eq!((ops[2].sender, ops[2].nonce), (SENDER, U256::from(1)));
        assert_eq!(submissions[0].beneficiary, BENEFICIARY);
    }

    #[tokio::test]
    async fn overrides_carry_buffered_gas_and_bumped_fees() {
        let h = harness();
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();

        h.bundler.tick().await.unwrap();

        let submission = &h.entry_point.submissions()[0];
        // (100k verification + 100k call + 21k overhead) * 1.2
        assert_eq!(submission.overrides.gas_limit, 265_200);
        // Mock fee data is 2 gwei / 1 gwei, bumped by 20%.
        assert_eq!(submission.overrides.max_fee_per_gas, 2_400_000_000);
        assert_eq!(submission.overrides.max_priority_fee_per_gas, 1_200_000_000);
    }

    #[tokio::test]
    async fn submission_failure_marks_bundle_and_ops_failed() {
        let h = harness();
        let admitted = h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.entry_point
            .fail_next_handle_ops(EntryPointError::SimulationFailed(
                "insufficient signer funds".to_string(),
            ));

        let bundle_id = h.bundler.tick().await.unwrap().expect("bundle created");

        let bundle = BundleStore::get(h.store.as_ref(), bundle_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.status, BundleStatus::Failed);
        assert!(bundle.error.as_deref().is_some_and(|e| !e.is_empty()));

        let row = h.store.find_by_hash(admitted.hash).await.unwrap().unwrap();
        assert_eq!(row.status, UserOpStatus::Failed);
        assert!(row.error.is_some());

        // Failed ops leave the cache and do not retry.
        assert_eq!(h.mempool.size().await.unwrap(), 0);
        assert!(h.kv.get(BUNDLE_LOCK_KEY).await.unwrap().is_none());

        // The pool keeps accepting new work afterwards.
        h.mempool.admit(test_user_op(SENDER, 1)).await.unwrap();
        let next = h.bundler.tick().await.unwrap().expect("second bundle");
        let next_bundle = BundleStore::get(h.store.as_ref(), next).await.unwrap().unwrap();
        assert_eq!(next_bundle.status, BundleStatus::Confirmed);
    }

    #[tokio::test]
    async fn transient_submission_error_is_retried_within_the_tick() {
        let h = harness();
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.entry_point
            .fail_next_handle_ops(EntryPointError::Rpc("connection reset".to_string()));

        let bundle_id = h.bundler.tick().await.unwrap().expect("bundle created");
        let bundle = BundleStore::get(h.store.as_ref(), bundle_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.status, BundleStatus::Confirmed);
        assert_eq!(h.entry_point.submissions().len(), 1);
    }

    #[tokio::test]
    async fn receipt_timeout_fails_the_bundle_after_submission() {
        let h = harness();
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.entry_point.set_receipt_mode(ReceiptMode::Timeout);

        let bundle_id = h.bundler.tick().await.unwrap().expect("bundle created");
        let bundle = BundleStore::get(h.store.as_ref(), bundle_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.status, BundleStatus::Failed);
        assert!(bundle.error.as_deref().unwrap().contains("receipt"));
        // Submission happened before the wait, so the hash is recorded.
        assert!(bundle.transaction_hash.is_some());
    }

    #[tokio::test]
    async fn reverted_bundle_transaction_is_a_failure() {
        let h = harness();
        h.mempool.admit(test_user_op(SENDER, 0)).await.unwrap();
        h.entry_point
            .set_receipt_mode(ReceiptMode::Reverted { block_number: 55 });

        let bundle_id = h.bundler.tick().await.unwrap().unwrap();
        let bundle = BundleStore::get(h.store.as_ref(), bundle_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.status, BundleStatus::Failed);
        assert!(bundle.error.as_deref().unwrap().contains("reverted"));
    }

    #[tokio::test]
    async fn concurrent_ticks_are_mutually_exclusive() {
        let h = harness();
        for nonce in 0..4 {
            h.mempool.admit(test_user_op(SENDER, nonce)).await.unwrap();
        }

        let bundler = Arc::new(h.bundler);
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let bundler = bundler.clone();
            tasks.push(tokio::spawn(async move { bundler.tick().await.unwrap() }));
        }

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                created += 1;
            }
        }
        // Only the lock holder bundles; everyone else skips their tick.
        assert_eq!(created, 1);
        assert_eq!(h.entry_point.submissions().len(), 1);
    }

    #[tokio::test]
    async fn selection_respects_max_ops_per_bundle() {
        let h = harness();
        for nonce in 0..12 {
            h.mempool.admit(test_user_op(SENDER, nonce)).await.unwrap();
        }

        h.bundler.tick().await.unwrap();
        assert_eq!(h.entry_point.submissions()[0].ops.len(), 10);
        // The overflow stays pending for the next tick.
        assert_eq!(
            h.store.count_by_status(UserOpStatus::Pending).await.unwrap(),
            2
        );
    }

    #[test]
    fn bundle_gas_is_buffered_and_capped() {
        let op = test_user_op(SENDER, 0);
        let record = opflow_core::UserOpRecord::admitted(B256::ZERO, op);

        // One op: (200k + 21k) * 1.2 = 265.2k, under the cap.
        assert_eq!(bundle_gas_limit(std::slice::from_ref(&record), 10_000_000, 20), 265_200);

        // Sixty ops blow past a small cap.
        let many = vec![record; 60];
        assert_eq!(bundle_gas_limit(&many, 10_000_000, 20), 10_000_000);
    }

    #[test]
    fn fee_bump_is_integer_percent() {
        let (max_fee, max_priority) = bumped_fees(
            FeeData {
                max_fee_per_gas: 1_000,
                max_priority_fee_per_gas: 99,
            },
            20,
        );
        assert_eq!(max_fee, 1_200);
        assert_eq!(max_priority, 118); // 99 * 120 / 100, floored
    }

    #[test]
    fn error_messages_are_truncated_to_255_chars() {
        let long = "x".repeat(400);
        assert_eq!(truncate_error(&long).len(), 255);
        assert_eq!(truncate_error("short"), "short");
    }
}
