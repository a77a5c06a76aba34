//! In-memory implementation of the store ports for tests.

use std::sync::Mutex;

use alloy_primitives::B256;
use async_trait::async_trait;
use opflow_core::{BundleRecord, UserOpRecord, UserOpStatus};
use uuid::Uuid;

use crate::traits::{BundleStore, StoreError, UserOpStore};

/// In-memory datastore with the same semantics as the Postgres
/// implementation: unique hashes, no row deletion, admission-ordered
/// pending reads.
#[derive(Debug, Default)]
pub struct MemoryDatastore {
    user_ops: Mutex<Vec<UserOpRecord>>,
    bundles: Mutex<Vec<BundleRecord>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row access for test assertions.
    pub fn user_op_rows(&self) -> Vec<UserOpRecord> {
        self.user_ops.lock().unwrap().clone()
    }

    /// Direct bundle access for test assertions.
    pub fn bundle_rows(&self) -> Vec<BundleRecord> {
        self.bundles.lock().unwrap().clone()
    }
}

#[async_trait]
impl UserOpStore for MemoryDatastore {
    async fn insert(&self, record: &UserOpRecord) -> Result<(), StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        if rows.iter().any(|r| r.hash == record.hash) {
            return Ok(());
        }
        rows.push(record.clone());
        Ok(())
    }

    async fn find_by_hash(&self, hash: B256) -> Result<Option<UserOpRecord>, StoreError> {
        Ok(self
            .user_ops
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.hash == hash)
            .cloned())
    }

    async fn pending(&self, limit: u32) -> Result<Vec<UserOpRecord>, StoreError> {
        let rows = self.user_ops.lock().unwrap();
        let mut pending: Vec<UserOpRecord> = rows
            .iter()
            .filter(|r| r.status == UserOpStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.submitted_at);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn count_by_status(&self, status: UserOpStatus) -> Result<u64, StoreError> {
        Ok(self
            .user_ops
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.status == status)
            .count() as u64)
    }

    async fn mark_removed(&self, hash: B256) -> Result<bool, StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        match rows
            .iter_mut()
            .find(|r| r.hash == hash && r.status == UserOpStatus::Pending)
        {
            Some(row) => {
                row.status = UserOpStatus::Removed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn assign_bundle(&self, hashes: &[B256], bundle_id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        for row in rows.iter_mut().filter(|r| hashes.contains(&r.hash)) {
            row.bundle_id = Some(bundle_id);
        }
        Ok(())
    }

    async fn mark_ops_submitted(
        &self,
        bundle_id: Uuid,
        transaction_hash: B256,
    ) -> Result<(), StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        for row in rows.iter_mut().filter(|r| r.bundle_id == Some(bundle_id)) {
            row.status = UserOpStatus::Submitted;
            row.transaction_hash = Some(transaction_hash);
        }
        Ok(())
    }

    async fn mark_ops_confirmed(
        &self,
        bundle_id: Uuid,
        block_number: u64,
    ) -> Result<(), StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        for row in rows.iter_mut().filter(|r| r.bundle_id == Some(bundle_id)) {
            row.status = UserOpStatus::Confirmed;
            row.block_number = Some(block_number);
        }
        Ok(())
    }

    async fn mark_ops_failed(&self, bundle_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut rows = self.user_ops.lock().unwrap();
        for row in rows.iter_mut().filter(|r| r.bundle_id == Some(bundle_id)) {
            row.status = UserOpStatus::Failed;
            row.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl BundleStore for MemoryDatastore {
    async fn insert(&self, bundle: &BundleRecord) -> Result<(), StoreError> {
        self.bundles.lock().unwrap().push(bundle.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BundleRecord>, StoreError> {
        Ok(self
            .bundles
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned())
    }

    async fn mark_submitted(&self, id: Uuid, transaction_hash: B256) -> Result<(), StoreError> {
        let mut rows = self.bundles.lock().unwrap();
        if let Some(bundle) = rows.iter_mut().find(|b| b.id == id) {
            bundle.status = opflow_core::BundleStatus::Submitted;
            bundle.transaction_hash = Some(transaction_hash);
        }
        Ok(())
    }

    async fn mark_confirmed(&self, id: Uuid, block_number: u64) -> Result<(), StoreError> {
        let mut rows = self.bundles.lock().unwrap();
        if let Some(bundle) = rows.iter_mut().find(|b| b.id == id) {
            bundle.status = opflow_core::BundleStatus::Confirmed;
            bundle.block_number = Some(block_number);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut rows = self.bundles.lock().unwrap();
        if let Some(bundle) = rows.iter_mut().find(|b| b.id == id) {
            bundle.status = opflow_core::BundleStatus::Failed;
            bundle.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<BundleRecord>, StoreError> {
        let rows = self.bundles.lock().unwrap();
        Ok(rows.iter().max_by_key(|b| b.submitted_at).cloned())
    }
}
