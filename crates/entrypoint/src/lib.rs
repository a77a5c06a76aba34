//! Typed port over the on-chain EntryPoint contract.
//!
//! Everything the rest of the service needs from the chain goes through
//! [`EntryPoint`]: validation simulation (revert-decoded), gas estimation,
//! bundle submission, receipt polling, fee data, and balance reads. The
//! signer behind `handle_ops` is single-writer; only the bundler loop
//! submits transactions.

pub mod abi;
pub mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::EntryPointClient;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockEntryPoint;

use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use opflow_core::UserOperation;

/// Errors surfaced by the EntryPoint adapter.
#[derive(Debug, thiserror::Error)]
pub enum EntryPointError {
    /// The EntryPoint rejected the operation during simulation.
    #[error("validation reverted: {reason}")]
    ValidationRevert { reason: String },
    /// The simulation call did not produce a decodable result payload.
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    /// Transport-level failure talking to the EVM endpoint.
    #[error("rpc: {0}")]
    Rpc(String),
}

impl EntryPointError {
    /// Transient errors are worth retrying within a bundler tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

/// Decoded `ValidationResult` revert payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub pre_op_gas: U256,
    pub prefund: U256,
    pub valid_after: u64,
    pub valid_until: u64,
    pub signature_failed: bool,
}

/// Result of `eth_estimateUserOperationGas`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Current chain fee data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Transaction parameters for a `handleOps` submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOverrides {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
    pub gas_limit: u64,
}

/// Minimal receipt view used for lifecycle updates and RPC reads.
#[derive(Debug, Clone)]
pub struct ReceiptInfo {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub block_hash: B256,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub success: bool,
    pub logs: Vec<alloy_rpc_types::Log>,
}

/// Deposit and stake state of an account at the EntryPoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositInfo {
    pub deposit: U256,
    pub staked: bool,
    pub stake: U256,
    pub unstake_delay_sec: u64,
    pub withdraw_time: u64,
}

/// Port over the EntryPoint contract and its EVM endpoint.
#[async_trait]
pub trait EntryPoint: Send + Sync {
    /// Address of the sole supported EntryPoint.
    fn address(&self) -> Address;

    /// Chain id the service is bound to.
    fn chain_id(&self) -> u64;

    async fn simulate_validation(
        &self,
        op: &UserOperation,
    ) -> Result<ValidationOutcome, EntryPointError>;

    async fn estimate_user_op_gas(
        &self,
        op: &UserOperation,
    ) -> Result<GasEstimate, EntryPointError>;

    /// Submit a bundle transaction; returns its hash without waiting for
    /// inclusion.
    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<B256, EntryPointError>;

    /// Poll for a receipt up to `timeout`; `None` means it did not land in
    /// time (the transaction may still confirm later).
    async fn wait_for_receipt(
        &self,
        transaction_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, EntryPointError>;

    /// One-shot receipt lookup for RPC reads.
    async fn transaction_receipt(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<ReceiptInfo>, EntryPointError>;

    /// Counterfactual sender for an init code, via revert decoding.
    async fn get_sender_address(&self, init_code: &Bytes) -> Result<Address, EntryPointError>;

    async fn get_deposit_info(&self, account: Address) -> Result<DepositInfo, EntryPointError>;

    async fn balance_of(&self, account: Address) -> Result<U256, EntryPointError>;

    async fn fee_data(&self) -> Result<FeeData, EntryPointError>;

    async fn block_number(&self) -> Result<u64, EntryPointError>;

    /// Native balance of the bundler signer, for the health check.
    async fn signer_balance(&self) -> Result<U256, EntryPointError>;
}

/// Gas estimate derived from a simulation outcome and current fees:
/// preVerificationGas is the simulated preOpGas, the verification limit is
/// padded x3/2, the call limit x11/10, and fees x110/100. Integer math
/// only, multiply before divide.
pub fn gas_estimate_from(
    op: &UserOperation,
    outcome: &ValidationOutcome,
    fees: FeeData,
) -> GasEstimate {
    GasEstimate {
        pre_verification_gas: outcome.pre_op_gas,
        verification_gas_limit: op.verification_gas_limit * U256::from(3) / U256::from(2),
        call_gas_limit: op.call_gas_limit * U256::from(11) / U256::from(10),
        max_fee_per_gas: fees.max_fee_per_gas.saturating_mul(110) / 100,
        max_priority_fee_per_gas: fees.max_priority_fee_per_gas.saturating_mul(110) / 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use opflow_core::test_utils::test_user_op;

    #[test]
    fn gas_estimate_applies_paddings() {
        let mut op = test_user_op(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 0);
        op.verification_gas_limit = U256::from(100_000);
        op.call_gas_limit = U256::from(200_000);

        let outcome = ValidationOutcome {
            pre_op_gas: U256::from(45_000),
            prefund: U256::ZERO,
            valid_after: 0,
            valid_until: u64::MAX,
            signature_failed: false,
        };
        let fees = FeeData {
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        };

        let estimate = gas_estimate_from(&op, &outcome, fees);
        assert_eq!(estimate.pre_verification_gas, U256::from(45_000));
        assert_eq!(estimate.verification_gas_limit, U256::from(150_000));
        assert_eq!(estimate.call_gas_limit, U256::from(220_000));
        assert_eq!(estimate.max_fee_per_gas, 2_200_000_000);
        assert_eq!(estimate.max_priority_fee_per_gas, 1_100_000_000);
    }

    #[test]
    fn padding_rounds_down_with_integer_math() {
        let mut op = test_user_op(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 0);
        op.verification_gas_limit = U256::from(3);
        op.call_gas_limit = U256::from(9);

        let outcome = ValidationOutcome {
            pre_op_gas: U256::ZERO,
            prefund: U256::ZERO,
            valid_after: 0,
            valid_until: 0,
            signature_failed: false,
        };
        let estimate = gas_estimate_from(
            &op,
            &outcome,
            FeeData {
                max_fee_per_gas: 3,
                max_priority_fee_per_gas: 9,
            },
        );

        // 3 * 3 / 2 = 4, 9 * 11 / 10 = 9 (multiply first, then divide)
        assert_eq!(estimate.verification_gas_limit, U256::from(4));
        assert_eq!(estimate.call_gas_limit, U256::from(9));
        assert_eq!(estimate.max_fee_per_gas, 3);
        assert_eq!(estimate.max_priority_fee_per_gas, 9);
    }

    #[test]
    fn only_rpc_errors_are_transient() {
        assert!(EntryPointError::Rpc("connection reset".into()).is_transient());
        assert!(
            !EntryPointError::ValidationRevert {
                reason: "AA25 invalid account nonce".into()
            }
            .is_transient()
        );
        assert!(!EntryPointError::SimulationFailed("no revert".into()).is_transient());
    }
}
