//! PostgreSQL implementation of the store ports.

use alloy_primitives::B256;
use async_trait::async_trait;
use opflow_core::{BundleRecord, BundleStatus, UserOpRecord, UserOpStatus, UserOperation};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::info;
use uuid::Uuid;

use crate::traits::{BundleStore, StoreError, UserOpStore};

const USER_OP_COLUMNS: &str = "id, hash, sender, nonce, user_op, status, bundle_id, \
     transaction_hash, block_number, error, submitted_at";

/// Postgres datastore implementing both [`UserOpStore`] and [`BundleStore`].
pub struct PostgresDatastore {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDatastore").finish_non_exhaustive()
    }
}

impl PostgresDatastore {
    /// Connect a bounded pool to `DATABASE_URL`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply the embedded migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Close the pool during shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_b256(text: &str) -> Result<B256, StoreError> {
    text.parse()
        .map_err(|_| StoreError::Decode(format!("bad hash column: {text}")))
}

fn user_op_from_row(row: &PgRow) -> Result<UserOpRecord, StoreError> {
    let hash: String = row.try_get("hash")?;
    let op_json: String = row.try_get("user_op")?;
    let status: String = row.try_get("status")?;
    let tx_hash: Option<String> = row.try_get("transaction_hash")?;
    let block_number: Option<i64> = row.try_get("block_number")?;

    let user_op: UserOperation = serde_json::from_str(&op_json)
        .map_err(|e| StoreError::Decode(format!("bad user_op column: {e}")))?;

    Ok(UserOpRecord {
        id: row.try_get("id")?,
        hash: parse_b256(&hash)?,
        user_op,
        status: UserOpStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("bad status column: {status}")))?,
        bundle_id: row.try_get("bundle_id")?,
        transaction_hash: tx_hash.as_deref().map(parse_b256).transpose()?,
        block_number: block_number.map(|n| n as u64),
        error: row.try_get("error")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn bundle_from_row(row: &PgRow) -> Result<BundleRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let tx_hash: Option<String> = row.try_get("transaction_hash")?;
    let block_number: Option<i64> = row.try_get("block_number")?;

    Ok(BundleRecord {
        id: row.try_get("id")?,
        status: BundleStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("bad status column: {status}")))?,
        transaction_hash: tx_hash.as_deref().map(parse_b256).transpose()?,
        block_number: block_number.map(|n| n as u64),
        error: row.try_get("error")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

#[async_trait]
impl UserOpStore for PostgresDatastore {
    async fn insert(&self, record: &UserOpRecord) -> Result<(), StoreError> {
        let op_json = serde_json::to_string(&record.user_op)
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        sqlx::query(
            "INSERT INTO user_operations \
                 (id, hash, sender, nonce, user_op, status, bundle_id, \
                  transaction_hash, block_number, error, submitted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(record.id)
        .bind(format!("{:#x}", record.hash))
        .bind(format!("{:#x}", record.user_op.sender))
        .bind(record.user_op.nonce.to_string())
        .bind(op_json)
        .bind(record.status.as_str())
        .bind(record.bundle_id)
        .bind(record.transaction_hash.map(|h| format!("{h:#x}")))
        .bind(record.block_number.map(|n| n as i64))
        .bind(record.error.as_deref())
        .bind(record.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_hash(&self, hash: B256) -> Result<Option<UserOpRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_OP_COLUMNS} FROM user_operations WHERE hash = $1"
        ))
        .bind(format!("{hash:#x}"))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_op_from_row).transpose()
    }

    async fn pending(&self, limit: u32) -> Result<Vec<UserOpRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_OP_COLUMNS} FROM user_operations \
             WHERE status = 'pending' ORDER BY submitted_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_op_from_row).collect()
    }

    async fn count_by_status(&self, status: UserOpStatus) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_operations WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn mark_removed(&self, hash: B256) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE user_operations SET status = 'removed' \
             WHERE hash = $1 AND status = 'pending'",
        )
        .bind(format!("{hash:#x}"))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_bundle(&self, hashes: &[B256], bundle_id: Uuid) -> Result<(), StoreError> {
        let hashes: Vec<String> = hashes.iter().map(|h| format!("{h:#x}")).collect();
        sqlx::query("UPDATE user_operations SET bundle_id = $1 WHERE hash = ANY($2)")
            .bind(bundle_id)
            .bind(&hashes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_ops_submitted(
        &self,
        bundle_id: Uuid,
        transaction_hash: B256,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE user_operations SET status = 'submitted', transaction_hash = $2 \
             WHERE bundle_id = $1",
        )
        .bind(bundle_id)
        .bind(format!("{transaction_hash:#x}"))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ops_confirmed(
        &self,
        bundle_id: Uuid,
        block_number: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE user_operations SET status = 'confirmed', block_number = $2 \
             WHERE bundle_id = $1",
        )
        .bind(bundle_id)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_ops_failed(&self, bundle_id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE user_operations SET status = 'failed', error = $2 WHERE bundle_id = $1",
        )
        .bind(bundle_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BundleStore for PostgresDatastore {
    async fn insert(&self, bundle: &BundleRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO bundles (id, status, transaction_hash, block_number, error, submitted_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(bundle.id)
        .bind(bundle.status.as_str())
        .bind(bundle.transaction_hash.map(|h| format!("{h:#x}")))
        .bind(bundle.block_number.map(|n| n as i64))
        .bind(bundle.error.as_deref())
        .bind(bundle.submitted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BundleRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, status, transaction_hash, block_number, error, submitted_at \
             FROM bundles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }

    async fn mark_submitted(&self, id: Uuid, transaction_hash: B256) -> Result<(), StoreError> {
        sqlx::query("UPDATE bundles SET status = 'submitted', transaction_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(format!("{transaction_hash:#x}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_confirmed(&self, id: Uuid, block_number: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE bundles SET status = 'confirmed', block_number = $2 WHERE id = $1")
            .bind(id)
            .bind(block_number as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE bundles SET status = 'failed', error = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest(&self) -> Result<Option<BundleRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, status, transaction_hash, block_number, error, submitted_at \
             FROM bundles ORDER BY submitted_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bundle_from_row).transpose()
    }
}
