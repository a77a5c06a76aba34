use alloy_primitives::B256;
use async_trait::async_trait;
use opflow_core::{BundleRecord, UserOpRecord, UserOpStatus};
use uuid::Uuid;

/// Errors surfaced by the durable store ports.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Decode(String),
}

/// Persistence port for user operations.
///
/// Lifecycle updates that follow a bundle (`submitted`, `confirmed`,
/// `failed`) address rows by bundle id; removal addresses the row by its
/// user operation hash.
#[async_trait]
pub trait UserOpStore: Send + Sync {
    /// Insert a newly admitted record. A concurrent insert of the same
    /// hash is a no-op (the hash column is unique).
    async fn insert(&self, record: &UserOpRecord) -> Result<(), StoreError>;

    async fn find_by_hash(&self, hash: B256) -> Result<Option<UserOpRecord>, StoreError>;

    /// Pending records, oldest admission first.
    async fn pending(&self, limit: u32) -> Result<Vec<UserOpRecord>, StoreError>;

    async fn count_by_status(&self, status: UserOpStatus) -> Result<u64, StoreError>;

    /// Mark a pending record removed, located by hash. Returns whether a
    /// pending row was transitioned.
    async fn mark_removed(&self, hash: B256) -> Result<bool, StoreError>;

    /// Attach a set of records to a bundle.
    async fn assign_bundle(&self, hashes: &[B256], bundle_id: Uuid) -> Result<(), StoreError>;

    async fn mark_ops_submitted(
        &self,
        bundle_id: Uuid,
        transaction_hash: B256,
    ) -> Result<(), StoreError>;

    async fn mark_ops_confirmed(&self, bundle_id: Uuid, block_number: u64)
    -> Result<(), StoreError>;

    async fn mark_ops_failed(&self, bundle_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Persistence port for bundles.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn insert(&self, bundle: &BundleRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<BundleRecord>, StoreError>;

    async fn mark_submitted(&self, id: Uuid, transaction_hash: B256) -> Result<(), StoreError>;

    async fn mark_confirmed(&self, id: Uuid, block_number: u64) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Most recently created bundle, if any.
    async fn latest(&self) -> Result<Option<BundleRecord>, StoreError>;
}
