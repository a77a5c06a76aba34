//! Scriptable mock EntryPoint for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use async_trait::async_trait;
use opflow_core::UserOperation;

use crate::{
    DepositInfo, EntryPoint, EntryPointError, FeeData, GasEstimate, ReceiptInfo, TxOverrides,
    ValidationOutcome, gas_estimate_from,
};

/// What the mock does when asked to wait for a receipt.
#[derive(Debug, Clone, Copy)]
pub enum ReceiptMode {
    /// Receipt lands with `success = true` in the given block.
    Confirm { block_number: u64 },
    /// Receipt lands but the bundle transaction reverted.
    Reverted { block_number: u64 },
    /// No receipt within the caller's timeout.
    Timeout,
}

/// A recorded `handle_ops` submission.
#[derive(Debug, Clone)]
pub struct SubmittedBundle {
    pub ops: Vec<UserOperation>,
    pub beneficiary: Address,
    pub overrides: TxOverrides,
    pub transaction_hash: B256,
}

/// Mock [`EntryPoint`] with configurable failures, in the spirit of a
/// scripted simulation engine: queue errors up front, then assert on the
/// recorded calls.
#[derive(Debug)]
pub struct MockEntryPoint {
    entry_point: Address,
    chain_id: u64,
    fees: Mutex<FeeData>,
    signer_balance: Mutex<U256>,
    validation_failures: Mutex<VecDeque<EntryPointError>>,
    handle_ops_failures: Mutex<VecDeque<EntryPointError>>,
    receipt_mode: Mutex<ReceiptMode>,
    submissions: Mutex<Vec<SubmittedBundle>>,
    simulated: AtomicU64,
    tx_counter: AtomicU64,
}

impl MockEntryPoint {
    pub fn new(entry_point: Address, chain_id: u64) -> Self {
        Self {
            entry_point,
            chain_id,
            fees: Mutex::new(FeeData {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000_000,
            }),
            signer_balance: Mutex::new(U256::from(10).pow(U256::from(18))),
            validation_failures: Mutex::new(VecDeque::new()),
            handle_ops_failures: Mutex::new(VecDeque::new()),
            receipt_mode: Mutex::new(ReceiptMode::Confirm { block_number: 100 }),
            submissions: Mutex::new(Vec::new()),
            simulated: AtomicU64::new(0),
            tx_counter: AtomicU64::new(0),
        }
    }

    /// Queue an error for the next `simulate_validation` call.
    pub fn reject_next_validation(&self, error: EntryPointError) {
        self.validation_failures.lock().unwrap().push_back(error);
    }

    /// Queue an error for the next `handle_ops` call.
    pub fn fail_next_handle_ops(&self, error: EntryPointError) {
        self.handle_ops_failures.lock().unwrap().push_back(error);
    }

    pub fn set_receipt_mode(&self, mode: ReceiptMode) {
        *self.receipt_mode.lock().unwrap() = mode;
    }

    pub fn set_signer_balance(&self, balance: U256) {
        *self.signer_balance.lock().unwrap() = balance;
    }

    /// All recorded `handle_ops` submissions.
    pub fn submissions(&self) -> Vec<SubmittedBundle> {
        self.submissions.lock().unwrap().clone()
    }

    /// Number of `simulate_validation` calls seen.
    pub fn simulated_count(&self) -> u64 {
        self.simulated.load(Ordering::SeqCst)
    }

    fn receipt_for(&self, transaction_hash: B256) -> Option<ReceiptInfo> {
        match *self.receipt_mode.lock().unwrap() {
            ReceiptMode::Confirm { block_number } => Some(ReceiptInfo {
                transaction_hash,
                block_number,
                block_hash: keccak256(block_number.to_be_bytes()),
                gas_used: 210_000,
                effective_gas_price: 1_500_000_000,
                success: true,
                logs: Vec::new(),
            }),
            ReceiptMode::Reverted { block_number } => Some(ReceiptInfo {
                transaction_hash,
                block_number,
                block_hash: keccak256(block_number.to_be_bytes()),
                gas_used: 60_000,
                effective_gas_price: 1_500_000_000,
                success: false,
                logs: Vec::new(),
            }),
            ReceiptMode::Timeout => None,
        }
    }
}

#[async_trait]
impl EntryPoint for MockEntryPoint {
    fn address(&self) -> Address {
        self.entry_point
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn simulate_validation(
        &self,
        _op: &UserOperation,
    ) -> Result<ValidationOutcome, EntryPointError> {
        self.simulated.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.validation_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(ValidationOutcome {
            pre_op_gas: U256::from(50_000),
            prefund: U256::from(1_000_000),
            valid_after: 0,
            valid_until: u64::MAX,
            signature_failed: false,
        })
    }

    async fn estimate_user_op_gas(
        &self,
        op: &UserOperation,
    ) -> Result<GasEstimate, EntryPointError> {
        let outcome = self.simulate_validation(op).await?;
        let fees = *self.fees.lock().unwrap();
        Ok(gas_estimate_from(op, &outcome, fees))
    }

    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<B256, EntryPointError> {
        if let Some(error) = self.handle_ops_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let seq = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let transaction_hash = keccak256(seq.to_be_bytes());
        self.submissions.lock().unwrap().push(SubmittedBundle {
            ops: ops.to_vec(),
            beneficiary,
            overrides,
            transaction_hash,
        });
        Ok(transaction_hash)
    }

    async fn wait_for_receipt(
        &self,
        transaction_hash: B256,
        _timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, EntryPointError> {
        Ok(self.receipt_for(transaction_hash))
    }

    async fn transaction_receipt(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<ReceiptInfo>, EntryPointError> {
        Ok(self.receipt_for(transaction_hash))
    }

    async fn get_sender_address(&self, init_code: &Bytes) -> Result<Address, EntryPointError> {
        let digest = keccak256(init_code);
        Ok(Address::from_slice(&digest[12..]))
    }

    async fn get_deposit_info(&self, _account: Address) -> Result<DepositInfo, EntryPointError> {
        Ok(DepositInfo {
            deposit: U256::from(1_000_000_000u64),
            staked: false,
            stake: U256::ZERO,
            unstake_delay_sec: 0,
            withdraw_time: 0,
        })
    }

    async fn balance_of(&self, _account: Address) -> Result<U256, EntryPointError> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn fee_data(&self) -> Result<FeeData, EntryPointError> {
        Ok(*self.fees.lock().unwrap())
    }

    async fn block_number(&self) -> Result<u64, EntryPointError> {
        Ok(100)
    }

    async fn signer_balance(&self) -> Result<U256, EntryPointError> {
        Ok(*self.signer_balance.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use opflow_core::test_utils::test_user_op;

    const ENTRY_POINT: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
    const SENDER: Address = address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266");

    #[tokio::test]
    async fn queued_failures_fire_once() {
        let mock = MockEntryPoint::new(ENTRY_POINT, 31337);
        mock.reject_next_validation(EntryPointError::ValidationRevert {
            reason: "AA25 invalid account nonce".to_string(),
        });

        let op = test_user_op(SENDER, 0);
        assert!(mock.simulate_validation(&op).await.is_err());
        assert!(mock.simulate_validation(&op).await.is_ok());
        assert_eq!(mock.simulated_count(), 2);
    }

    #[tokio::test]
    async fn submissions_are_recorded_with_distinct_hashes() {
        let mock = MockEntryPoint::new(ENTRY_POINT, 31337);
        let ops = vec![test_user_op(SENDER, 0)];
        let overrides = TxOverrides {
            max_fee_per_gas: 1,
            max_priority_fee_per_gas: 1,
            gas_limit: 100_000,
        };

        let first = mock.handle_ops(&ops, SENDER, overrides).await.unwrap();
        let second = mock.handle_ops(&ops, SENDER, overrides).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(mock.submissions().len(), 2);

        let receipt = mock
            .wait_for_receipt(first, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(receipt.success);
    }

    #[tokio::test]
    async fn account_views_return_canned_state() {
        let mock = MockEntryPoint::new(ENTRY_POINT, 31337);

        let info = mock.get_deposit_info(SENDER).await.unwrap();
        assert_eq!(info.deposit, U256::from(1_000_000_000u64));
        assert!(!info.staked);

        assert_eq!(
            mock.balance_of(SENDER).await.unwrap(),
            U256::from(1_000_000_000u64)
        );

        // Sender derivation is deterministic in the init code.
        let init_code = Bytes::from(vec![0x01, 0x02]);
        let a = mock.get_sender_address(&init_code).await.unwrap();
        let b = mock.get_sender_address(&init_code).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Address::ZERO);
    }
}
