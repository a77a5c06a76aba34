//! EIP-4337 Account Abstraction user operation types.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_sol_types::SolValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User operation as defined by EIP-4337 v0.6.
///
/// Numeric fields accept decimal strings or `0x`-prefixed hex on the wire
/// and serialize back as `0x`-prefixed hex; `bytes` fields are `0x`-hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    #[serde(default)]
    pub init_code: Bytes,
    #[serde(default)]
    pub call_data: Bytes,
    #[serde(default)]
    pub call_gas_limit: U256,
    #[serde(default)]
    pub verification_gas_limit: U256,
    #[serde(default)]
    pub pre_verification_gas: U256,
    #[serde(default)]
    pub max_fee_per_gas: U256,
    #[serde(default)]
    pub max_priority_fee_per_gas: U256,
    #[serde(default)]
    pub paymaster_and_data: Bytes,
    #[serde(default)]
    pub signature: Bytes,
}

impl UserOperation {
    /// Canonical EIP-4337 user operation hash.
    ///
    /// `keccak256(abi.encode(keccak256(abi.encode(fields)), entryPoint, chainId))`
    /// where the inner encoding hashes the three dynamic `bytes` fields first.
    /// Pure function of its inputs; every node derives the same hash.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode();

        let preimage = (keccak256(&packed), entry_point, U256::from(chain_id)).abi_encode();
        keccak256(&preimage)
    }
}

/// Lifecycle of an admitted user operation.
///
/// Transitions are monotonic except `pending -> removed`, which happens on
/// fee-bump replacement or explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserOpStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
    Removed,
}

impl UserOpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// A user operation as tracked by the durable store.
///
/// Rows are created on admission and only ever transition status; they are
/// never deleted, so the store doubles as an audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpRecord {
    pub id: Uuid,
    pub hash: B256,
    pub user_op: UserOperation,
    pub status: UserOpStatus,
    pub bundle_id: Option<Uuid>,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl UserOpRecord {
    /// A freshly admitted pending record.
    pub fn admitted(hash: B256, user_op: UserOperation) -> Self {
        Self {
            id: Uuid::new_v4(),
            hash,
            user_op,
            status: UserOpStatus::Pending,
            bundle_id: None,
            transaction_hash: None,
            block_number: None,
            error: None,
            submitted_at: Utc::now(),
        }
    }
}
