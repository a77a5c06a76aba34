//! Alloy-backed EntryPoint adapter.

use std::time::Duration;

use alloy_consensus::TxReceipt as _;
use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, U256, hex};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Revert, SolCall, SolError};
use async_trait::async_trait;
use opflow_core::UserOperation;
use tracing::debug;
use url::Url;

use crate::abi::IEntryPoint;
use crate::{
    DepositInfo, EntryPoint, EntryPointError, FeeData, GasEstimate, ReceiptInfo, TxOverrides,
    ValidationOutcome, gas_estimate_from,
};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// EntryPoint adapter over an HTTP EVM endpoint with a local signer.
pub struct EntryPointClient {
    provider: DynProvider,
    entry_point: Address,
    chain_id: u64,
    signer_address: Address,
}

impl std::fmt::Debug for EntryPointClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPointClient")
            .field("entry_point", &self.entry_point)
            .field("chain_id", &self.chain_id)
            .field("signer", &self.signer_address)
            .finish_non_exhaustive()
    }
}

impl EntryPointClient {
    /// Wire a provider with the bundler signer against `rpc_url`.
    pub fn new(rpc_url: Url, signer: PrivateKeySigner, entry_point: Address, chain_id: u64) -> Self {
        let signer_address = signer.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(rpc_url)
            .erased();
        Self {
            provider,
            entry_point,
            chain_id,
            signer_address,
        }
    }

    fn request_to_entry_point(&self, input: Vec<u8>) -> TransactionRequest {
        TransactionRequest::default()
            .with_to(self.entry_point)
            .with_input(input)
    }

    async fn send(&self, tx: TransactionRequest) -> Result<B256, EntryPointError> {
        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    /// `depositTo` passthrough.
    pub async fn deposit_to(&self, account: Address, value: U256) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::depositToCall { account };
        let tx = self.request_to_entry_point(call.abi_encode()).with_value(value);
        self.send(tx).await
    }

    /// `addStake` passthrough.
    pub async fn add_stake(
        &self,
        unstake_delay_sec: u32,
        value: U256,
    ) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::addStakeCall {
            unstakeDelaySec: unstake_delay_sec,
        };
        let tx = self.request_to_entry_point(call.abi_encode()).with_value(value);
        self.send(tx).await
    }

    /// `unlockStake` passthrough.
    pub async fn unlock_stake(&self) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::unlockStakeCall {};
        self.send(self.request_to_entry_point(call.abi_encode())).await
    }

    /// `withdrawStake` passthrough.
    pub async fn withdraw_stake(&self, withdraw_address: Address) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::withdrawStakeCall {
            withdrawAddress: withdraw_address,
        };
        self.send(self.request_to_entry_point(call.abi_encode())).await
    }

    /// `withdrawTo` passthrough.
    pub async fn withdraw_to(
        &self,
        withdraw_address: Address,
        amount: U256,
    ) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::withdrawToCall {
            withdrawAddress: withdraw_address,
            withdrawAmount: amount,
        };
        self.send(self.request_to_entry_point(call.abi_encode())).await
    }

    /// Run an `eth_call` that is expected to revert with a result payload.
    /// Returns the revert data, or an error describing which of the three
    /// outcomes (clean return, opaque error, transport failure) happened.
    async fn call_expecting_revert(
        &self,
        input: Vec<u8>,
        method: &str,
    ) -> Result<Bytes, EntryPointError> {
        match self.provider.call(self.request_to_entry_point(input)).await {
            Ok(_) => Err(EntryPointError::SimulationFailed(format!(
                "{method} returned without reverting; wrong EntryPoint address?"
            ))),
            Err(err) => match err.as_error_resp() {
                Some(payload) => payload.as_revert_data().ok_or_else(|| {
                    EntryPointError::SimulationFailed(format!(
                        "{method} reverted without payload: {}",
                        payload.message
                    ))
                }),
                None => Err(EntryPointError::Rpc(err.to_string())),
            },
        }
    }
}

/// Decode a `simulateValidation` revert payload.
///
/// `ValidationResult` is the success shape; `FailedOp` and plain
/// `Error(string)` reverts carry a rejection reason; anything else is an
/// undecodable payload.
pub(crate) fn decode_validation_revert(data: &[u8]) -> Result<ValidationOutcome, EntryPointError> {
    if let Ok(result) = IEntryPoint::ValidationResult::abi_decode(data) {
        return Ok(ValidationOutcome {
            pre_op_gas: result.preOpGas,
            prefund: result.prefund,
            valid_after: u64::try_from(result.validAfter).unwrap_or(u64::MAX),
            valid_until: u64::try_from(result.validUntil).unwrap_or(u64::MAX),
            signature_failed: !result.signatureFailed.is_empty(),
        });
    }
    if let Ok(failed) = IEntryPoint::FailedOp::abi_decode(data) {
        return Err(EntryPointError::ValidationRevert {
            reason: failed.reason,
        });
    }
    if let Ok(revert) = Revert::abi_decode(data) {
        return Err(EntryPointError::ValidationRevert {
            reason: revert.reason,
        });
    }
    Err(EntryPointError::SimulationFailed(format!(
        "undecodable revert payload: 0x{}",
        hex::encode(data)
    )))
}

/// Decode a `getSenderAddress` revert payload.
pub(crate) fn decode_sender_revert(data: &[u8]) -> Result<Address, EntryPointError> {
    if let Ok(result) = IEntryPoint::SenderAddressResult::abi_decode(data) {
        return Ok(result.sender);
    }
    if let Ok(revert) = Revert::abi_decode(data) {
        return Err(EntryPointError::ValidationRevert {
            reason: revert.reason,
        });
    }
    Err(EntryPointError::SimulationFailed(format!(
        "undecodable revert payload: 0x{}",
        hex::encode(data)
    )))
}

fn receipt_info(receipt: alloy_rpc_types::TransactionReceipt) -> ReceiptInfo {
    ReceiptInfo {
        transaction_hash: receipt.transaction_hash,
        block_number: receipt.block_number.unwrap_or_default(),
        block_hash: receipt.block_hash.unwrap_or_default(),
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        success: receipt.status(),
        logs: receipt.inner.logs().to_vec(),
    }
}

#[async_trait]
impl EntryPoint for EntryPointClient {
    fn address(&self) -> Address {
        self.entry_point
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn simulate_validation(
        &self,
        op: &UserOperation,
    ) -> Result<ValidationOutcome, EntryPointError> {
        let call = IEntryPoint::simulateValidationCall { userOp: op.into() };
        let data = self
            .call_expecting_revert(call.abi_encode(), "simulateValidation")
            .await?;
        decode_validation_revert(&data)
    }

    async fn estimate_user_op_gas(
        &self,
        op: &UserOperation,
    ) -> Result<GasEstimate, EntryPointError> {
        let outcome = self.simulate_validation(op).await?;
        let fees = self.fee_data().await?;
        Ok(gas_estimate_from(op, &outcome, fees))
    }

    async fn handle_ops(
        &self,
        ops: &[UserOperation],
        beneficiary: Address,
        overrides: TxOverrides,
    ) -> Result<B256, EntryPointError> {
        let call = IEntryPoint::handleOpsCall {
            ops: ops.iter().map(Into::into).collect(),
            beneficiary,
        };
        let tx = self
            .request_to_entry_point(call.abi_encode())
            .with_gas_limit(overrides.gas_limit)
            .with_max_fee_per_gas(overrides.max_fee_per_gas)
            .with_max_priority_fee_per_gas(overrides.max_priority_fee_per_gas);

        let hash = self.send(tx).await?;
        debug!(tx_hash = %hash, ops = ops.len(), "submitted handleOps transaction");
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        transaction_hash: B256,
        timeout: Duration,
    ) -> Result<Option<ReceiptInfo>, EntryPointError> {
        let poll = async {
            loop {
                if let Some(info) = self.transaction_receipt(transaction_hash).await? {
                    return Ok::<_, EntryPointError>(info);
                }
                tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    async fn transaction_receipt(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<ReceiptInfo>, EntryPointError> {
        let receipt = self
            .provider
            .get_transaction_receipt(transaction_hash)
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))?;
        Ok(receipt.map(receipt_info))
    }

    async fn get_sender_address(&self, init_code: &Bytes) -> Result<Address, EntryPointError> {
        let call = IEntryPoint::getSenderAddressCall {
            initCode: init_code.clone(),
        };
        let data = self
            .call_expecting_revert(call.abi_encode(), "getSenderAddress")
            .await?;
        decode_sender_revert(&data)
    }

    async fn get_deposit_info(&self, account: Address) -> Result<DepositInfo, EntryPointError> {
        let call = IEntryPoint::getDepositInfoCall { account };
        let data = self
            .provider
            .call(self.request_to_entry_point(call.abi_encode()))
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))?;
        let info = IEntryPoint::getDepositInfoCall::abi_decode_returns(&data)
            .map_err(|e| EntryPointError::SimulationFailed(format!("getDepositInfo: {e}")))?;
        Ok(DepositInfo {
            deposit: info.deposit,
            staked: info.staked,
            stake: info.stake,
            unstake_delay_sec: u64::try_from(info.unstakeDelaySec).unwrap_or(u64::MAX),
            withdraw_time: u64::try_from(info.withdrawTime).unwrap_or(u64::MAX),
        })
    }

    async fn balance_of(&self, account: Address) -> Result<U256, EntryPointError> {
        let call = IEntryPoint::balanceOfCall { account };
        let data = self
            .provider
            .call(self.request_to_entry_point(call.abi_encode()))
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))?;
        IEntryPoint::balanceOfCall::abi_decode_returns(&data)
            .map_err(|e| EntryPointError::SimulationFailed(format!("balanceOf: {e}")))
    }

    async fn fee_data(&self) -> Result<FeeData, EntryPointError> {
        let estimate = self
            .provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))?;
        Ok(FeeData {
            max_fee_per_gas: estimate.max_fee_per_gas,
            max_priority_fee_per_gas: estimate.max_priority_fee_per_gas,
        })
    }

    async fn block_number(&self) -> Result<u64, EntryPointError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))
    }

    async fn signer_balance(&self) -> Result<U256, EntryPointError> {
        self.provider
            .get_balance(self.signer_address)
            .await
            .map_err(|e| EntryPointError::Rpc(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn validation_result_revert_is_success() {
        let payload = IEntryPoint::ValidationResult {
            preOpGas: U256::from(48_000),
            prefund: U256::from(1_000_000),
            validAfter: U256::ZERO,
            validUntil: U256::from(1_900_000_000u64),
            signatureFailed: Bytes::new(),
        }
        .abi_encode();

        let outcome = decode_validation_revert(&payload).unwrap();
        assert_eq!(outcome.pre_op_gas, U256::from(48_000));
        assert_eq!(outcome.prefund, U256::from(1_000_000));
        assert_eq!(outcome.valid_until, 1_900_000_000);
        assert!(!outcome.signature_failed);
    }

    #[test]
    fn non_empty_signature_failed_flag_is_carried() {
        let payload = IEntryPoint::ValidationResult {
            preOpGas: U256::from(48_000),
            prefund: U256::ZERO,
            validAfter: U256::ZERO,
            validUntil: U256::ZERO,
            signatureFailed: Bytes::from(vec![1]),
        }
        .abi_encode();

        assert!(decode_validation_revert(&payload).unwrap().signature_failed);
    }

    #[test]
    fn failed_op_revert_is_a_validation_rejection() {
        let payload = IEntryPoint::FailedOp {
            opIndex: U256::ZERO,
            reason: "AA25 invalid account nonce".into(),
        }
        .abi_encode();

        let err = decode_validation_revert(&payload).unwrap_err();
        match err {
            EntryPointError::ValidationRevert { reason } => {
                assert_eq!(reason, "AA25 invalid account nonce");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn plain_revert_string_is_a_validation_rejection() {
        let payload = Revert {
            reason: "paymaster deposit too low".to_string(),
        }
        .abi_encode();
        let err = decode_validation_revert(&payload).unwrap_err();
        match err {
            EntryPointError::ValidationRevert { reason } => {
                assert_eq!(reason, "paymaster deposit too low");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn garbage_revert_payload_is_simulation_failure() {
        let err = decode_validation_revert(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap_err();
        assert!(matches!(err, EntryPointError::SimulationFailed(_)));
    }

    #[test]
    fn sender_address_revert_decodes() {
        let sender = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");
        let payload = IEntryPoint::SenderAddressResult { sender }.abi_encode();
        assert_eq!(decode_sender_revert(&payload).unwrap(), sender);

        let err = decode_sender_revert(&[0x00, 0x01]).unwrap_err();
        assert!(matches!(err, EntryPointError::SimulationFailed(_)));
    }
}
