//! Shared fixtures for tests across the workspace.

use alloy_primitives::{Address, Bytes, U256};

use crate::UserOperation;

/// A plausible v0.6 user operation with 1 gwei fees.
pub fn test_user_op(sender: Address, nonce: u64) -> UserOperation {
    UserOperation {
        sender,
        nonce: U256::from(nonce),
        init_code: Bytes::new(),
        call_data: Bytes::new(),
        call_gas_limit: U256::from(100_000),
        verification_gas_limit: U256::from(100_000),
        pre_verification_gas: U256::from(21_000),
        max_fee_per_gas: U256::from(1_000_000_000u64),
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        paymaster_and_data: Bytes::new(),
        signature: Bytes::from(vec![0xab; 65]),
    }
}

/// Same operation with explicit fee caps, for replacement tests.
pub fn test_user_op_with_fees(
    sender: Address,
    nonce: u64,
    max_fee_per_gas: u64,
    max_priority_fee_per_gas: u64,
) -> UserOperation {
    let mut op = test_user_op(sender, nonce);
    op.max_fee_per_gas = U256::from(max_fee_per_gas);
    op.max_priority_fee_per_gas = U256::from(max_priority_fee_per_gas);
    op
}
