//! Bundle records: one `handleOps` transaction worth of user operations.

use alloy_primitives::B256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a bundle transaction.
///
/// `pending -> submitted -> confirmed` on the happy path; `failed` is
/// reachable from `pending` and `submitted`. `confirmed` and `failed` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Pending,
    Submitted,
    Confirmed,
    Failed,
}

impl BundleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed)
    }
}

/// A bundle as tracked by the durable store.
///
/// User operations reference their bundle through `bundle_id`; the bundle
/// itself carries no back-pointers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub id: Uuid,
    pub status: BundleStatus,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl BundleRecord {
    /// A freshly created pending bundle.
    pub fn created() -> Self {
        Self {
            id: Uuid::new_v4(),
            status: BundleStatus::Pending,
            transaction_hash: None,
            block_number: None,
            error: None,
            submitted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_database_text() {
        for status in [
            BundleStatus::Pending,
            BundleStatus::Submitted,
            BundleStatus::Confirmed,
            BundleStatus::Failed,
        ] {
            assert_eq!(BundleStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!BundleStatus::Pending.is_terminal());
        assert!(!BundleStatus::Submitted.is_terminal());
        assert!(BundleStatus::Confirmed.is_terminal());
        assert!(BundleStatus::Failed.is_terminal());
    }

    #[test]
    fn created_bundle_is_pending() {
        let bundle = BundleRecord::created();
        assert_eq!(bundle.status, BundleStatus::Pending);
        assert!(bundle.transaction_hash.is_none());
        assert!(bundle.error.is_none());
    }
}
