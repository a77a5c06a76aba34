//! ABI bindings for the EntryPoint v0.6 contract.
//!
//! `simulateValidation` and `getSenderAddress` report their results as
//! revert payloads (`ValidationResult` / `SenderAddressResult`); a clean
//! return from either is a misconfigured endpoint.

use alloy_sol_types::sol;
use opflow_core::UserOperation;

sol! {
    /// Wire shape of an EIP-4337 v0.6 user operation.
    struct PackedOp {
        address sender;
        uint256 nonce;
        bytes initCode;
        bytes callData;
        uint256 callGasLimit;
        uint256 verificationGasLimit;
        uint256 preVerificationGas;
        uint256 maxFeePerGas;
        uint256 maxPriorityFeePerGas;
        bytes paymasterAndData;
        bytes signature;
    }

    /// Deposit and stake info returned by `getDepositInfo`.
    struct StakeInfo {
        uint256 deposit;
        bool staked;
        uint256 stake;
        uint256 unstakeDelaySec;
        uint256 withdrawTime;
    }

    interface IEntryPoint {
        function handleOps(PackedOp[] calldata ops, address payable beneficiary) external;
        function simulateValidation(PackedOp calldata userOp) external;
        function getSenderAddress(bytes calldata initCode) external;
        function getDepositInfo(address account) external view returns (StakeInfo info);
        function balanceOf(address account) external view returns (uint256);
        function depositTo(address account) external payable;
        function addStake(uint32 unstakeDelaySec) external payable;
        function unlockStake() external;
        function withdrawStake(address payable withdrawAddress) external;
        function withdrawTo(address payable withdrawAddress, uint256 withdrawAmount) external;

        error ValidationResult(
            uint256 preOpGas,
            uint256 prefund,
            uint256 validAfter,
            uint256 validUntil,
            bytes signatureFailed
        );
        error SenderAddressResult(address sender);
        error FailedOp(uint256 opIndex, string reason);
    }
}

impl From<&UserOperation> for PackedOp {
    fn from(op: &UserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            initCode: op.init_code.clone(),
            callData: op.call_data.clone(),
            callGasLimit: op.call_gas_limit,
            verificationGasLimit: op.verification_gas_limit,
            preVerificationGas: op.pre_verification_gas,
            maxFeePerGas: op.max_fee_per_gas,
            maxPriorityFeePerGas: op.max_priority_fee_per_gas,
            paymasterAndData: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use alloy_sol_types::SolCall;
    use opflow_core::test_utils::test_user_op;

    #[test]
    fn handle_ops_calldata_has_selector_and_round_trips() {
        let op = test_user_op(address!("f39Fd6e51aad88F6F4ce6aB8827279cffFb92266"), 0);
        let beneficiary = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

        let call = IEntryPoint::handleOpsCall {
            ops: vec![(&op).into()],
            beneficiary,
        };
        let data = call.abi_encode();
        assert_eq!(&data[..4], IEntryPoint::handleOpsCall::SELECTOR);

        let decoded = IEntryPoint::handleOpsCall::abi_decode(&data).unwrap();
        assert_eq!(decoded.beneficiary, beneficiary);
        assert_eq!(decoded.ops.len(), 1);
        assert_eq!(decoded.ops[0].sender, op.sender);
        assert_eq!(decoded.ops[0].nonce, op.nonce);
        assert_eq!(decoded.ops[0].signature, op.signature);
    }

    #[test]
    fn stake_management_calldata_encodes() {
        let to = address!("70997970C51812dc3A010C7d01b50e0d17dc79C8");

        let add = IEntryPoint::addStakeCall { unstakeDelaySec: 86_400 }.abi_encode();
        assert_eq!(&add[..4], IEntryPoint::addStakeCall::SELECTOR);

        let unlock = IEntryPoint::unlockStakeCall {}.abi_encode();
        assert_eq!(&unlock[..4], IEntryPoint::unlockStakeCall::SELECTOR);

        let withdraw = IEntryPoint::withdrawStakeCall { withdrawAddress: to }.abi_encode();
        assert_eq!(&withdraw[..4], IEntryPoint::withdrawStakeCall::SELECTOR);

        let withdraw_to = IEntryPoint::withdrawToCall {
            withdrawAddress: to,
            withdrawAmount: alloy_primitives::U256::from(1_000),
        }
        .abi_encode();
        assert_eq!(&withdraw_to[..4], IEntryPoint::withdrawToCall::SELECTOR);
    }
}
