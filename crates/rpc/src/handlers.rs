//! Method implementations behind the dispatcher.

use alloy_primitives::{Address, B256, U256};
use opflow_core::UserOperation;
use opflow_entrypoint::EntryPointError;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::{ErrorCode, RpcError, classify_validation_reason};
use crate::RpcState;

pub(crate) async fn route_method(
    state: &RpcState,
    method: &str,
    params: &[Value],
) -> Result<Value, RpcError> {
    match method {
        "eth_chainId" => Ok(json!(format!("0x{:x}", state.entry_point.chain_id()))),
        "eth_supportedEntryPoints" => Ok(json!([state.entry_point.address()])),
        "eth_estimateUserOperationGas" => estimate_user_operation_gas(state, params).await,
        "eth_sendUserOperation" => send_user_operation(state, params).await,
        "eth_getUserOperationByHash" => get_user_operation_by_hash(state, params).await,
        "eth_getUserOperationReceipt" => get_user_operation_receipt(state, params).await,
        "eth_bundler_clearMempool" => clear_mempool(state).await,
        "eth_bundler_getStatus" => bundler_status(state).await,
        _ => Err(RpcError::method_not_found(method)),
    }
}

fn parse_param<T: DeserializeOwned>(
    params: &[Value],
    index: usize,
    name: &str,
) -> Result<T, RpcError> {
    let value = params
        .get(index)
        .ok_or_else(|| RpcError::invalid_params(format!("missing param {index}: {name}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| RpcError::invalid_params(format!("invalid {name}: {e}")))
}

/// Methods taking an `entryPoint` parameter only serve the configured
/// address (addresses parse case-insensitively).
fn ensure_supported_entry_point(
    state: &RpcState,
    params: &[Value],
    index: usize,
) -> Result<(), RpcError> {
    let requested: Address = parse_param(params, index, "entryPoint")?;
    let supported = state.entry_point.address();
    if requested != supported {
        return Err(RpcError::invalid_params(format!(
            "unsupported EntryPoint {requested}; only {supported} is supported"
        )));
    }
    Ok(())
}

fn entrypoint_error(error: EntryPointError) -> RpcError {
    match error {
        EntryPointError::ValidationRevert { reason } => {
            RpcError::new(classify_validation_reason(&reason), reason)
        }
        EntryPointError::SimulationFailed(message) => {
            RpcError::new(ErrorCode::InvalidUserOp, message)
        }
        EntryPointError::Rpc(message) => RpcError::new(ErrorCode::EntryPointFault, message),
    }
}

async fn estimate_user_operation_gas(
    state: &RpcState,
    params: &[Value],
) -> Result<Value, RpcError> {
    let op: UserOperation = parse_param(params, 0, "userOperation")?;
    ensure_supported_entry_point(state, params, 1)?;

    let estimate = state
        .entry_point
        .estimate_user_op_gas(&op)
        .await
        .map_err(entrypoint_error)?;

    Ok(json!({
        "preVerificationGas": estimate.pre_verification_gas,
        "verificationGasLimit": estimate.verification_gas_limit,
        "callGasLimit": estimate.call_gas_limit,
        "maxFeePerGas": format!("0x{:x}", estimate.max_fee_per_gas),
        "maxPriorityFeePerGas": format!("0x{:x}", estimate.max_priority_fee_per_gas),
    }))
}

async fn send_user_operation(state: &RpcState, params: &[Value]) -> Result<Value, RpcError> {
    let op: UserOperation = parse_param(params, 0, "userOperation")?;
    ensure_supported_entry_point(state, params, 1)?;

    let admission = state.mempool.admit(op).await?;
    Ok(json!(admission.hash))
}

async fn get_user_operation_by_hash(
    state: &RpcState,
    params: &[Value],
) -> Result<Value, RpcError> {
    let hash: B256 = parse_param(params, 0, "userOpHash")?;
    let Some(record) = state
        .mempool
        .get(hash)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?
    else {
        return Ok(Value::Null);
    };

    let mut block_number = record.block_number;
    let mut block_hash: Option<B256> = None;
    if let Some(tx_hash) = record.transaction_hash
        && let Some(receipt) = state
            .entry_point
            .transaction_receipt(tx_hash)
            .await
            .map_err(entrypoint_error)?
    {
        block_number = Some(receipt.block_number);
        block_hash = Some(receipt.block_hash);
    }

    Ok(json!({
        "userOperation": record.user_op,
        "entryPoint": state.entry_point.address(),
        "blockNumber": block_number.map(|n| format!("0x{n:x}")),
        "blockHash": block_hash,
        "transactionHash": record.transaction_hash,
    }))
}

async fn get_user_operation_receipt(
    state: &RpcState,
    params: &[Value],
) -> Result<Value, RpcError> {
    let hash: B256 = parse_param(params, 0, "userOpHash")?;
    let Some(record) = state
        .mempool
        .get(hash)
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?
    else {
        return Ok(Value::Null);
    };
    // Not mined yet (or never will be): no receipt.
    let Some(tx_hash) = record.transaction_hash else {
        return Ok(Value::Null);
    };
    let Some(receipt) = state
        .entry_point
        .transaction_receipt(tx_hash)
        .await
        .map_err(entrypoint_error)?
    else {
        return Ok(Value::Null);
    };

    let actual_gas_cost = U256::from(receipt.gas_used) * U256::from(receipt.effective_gas_price);
    Ok(json!({
        "userOpHash": record.hash,
        "entryPoint": state.entry_point.address(),
        "sender": record.user_op.sender,
        "nonce": record.user_op.nonce,
        "actualGasCost": actual_gas_cost,
        "actualGasUsed": format!("0x{:x}", receipt.gas_used),
        "success": receipt.success,
        "logs": receipt.logs,
        "receipt": {
            "transactionHash": receipt.transaction_hash,
            "blockNumber": format!("0x{:x}", receipt.block_number),
            "blockHash": receipt.block_hash,
            "gasUsed": format!("0x{:x}", receipt.gas_used),
            "effectiveGasPrice": format!("0x{:x}", receipt.effective_gas_price),
            "status": if receipt.success { "0x1" } else { "0x0" },
        },
    }))
}

async fn clear_mempool(state: &RpcState) -> Result<Value, RpcError> {
    state
        .mempool
        .clear()
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;
    Ok(json!({ "cleared": true }))
}

async fn bundler_status(state: &RpcState) -> Result<Value, RpcError> {
    let mempool_size = state
        .mempool
        .size()
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;
    let latest = state
        .bundles
        .latest()
        .await
        .map_err(|e| RpcError::internal(e.to_string()))?;

    Ok(json!({
        "isRunning": state.bundler.is_running(),
        "mempoolSize": mempool_size,
        "lastBundleId": latest.as_ref().map(|b| b.id),
        "lastBundleTime": latest.as_ref().map(|b| b.submitted_at.to_rfc3339()),
    }))
}
