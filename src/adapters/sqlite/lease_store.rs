//! SQLite implementation of the LeaseStore.
//!
//! Every mutation is a single conditional statement, so two processes sharing
//! the database file cannot both win the same swap.

use async_trait::async_trait;
use sqlx::SqlitePool;

use super::parse_datetime;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::LockLease;
use crate::domain::ports::LeaseStore;

#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn token_to_db(token: u64) -> DomainResult<i64> {
    i64::try_from(token).map_err(|_| DomainError::Persistence(format!("fencing token {token} out of range")))
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn get(&self, workflow_id: &str) -> DomainResult<Option<LockLease>> {
        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT workflow_id, holder_id, fencing_token, acquired_at, expires_at, released
             FROM workflow_leases WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn insert_if_absent(&self, lease: &LockLease) -> DomainResult<bool> {
        let result = sqlx::query(
            "INSERT INTO workflow_leases (workflow_id, holder_id, fencing_token, acquired_at, expires_at, released)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(workflow_id) DO NOTHING",
        )
        .bind(&lease.workflow_id)
        .bind(&lease.holder_id)
        .bind(token_to_db(lease.fencing_token)?)
        .bind(lease.acquired_at.to_rfc3339())
        .bind(lease.expires_at.to_rfc3339())
        .bind(lease.released)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_swap(&self, expected: &LockLease, new: &LockLease) -> DomainResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_leases
             SET holder_id = ?, fencing_token = ?, acquired_at = ?, expires_at = ?, released = ?
             WHERE workflow_id = ? AND holder_id = ? AND fencing_token = ? AND expires_at = ? AND released = ?",
        )
        .bind(&new.holder_id)
        .bind(token_to_db(new.fencing_token)?)
        .bind(new.acquired_at.to_rfc3339())
        .bind(new.expires_at.to_rfc3339())
        .bind(new.released)
        .bind(&expected.workflow_id)
        .bind(&expected.holder_id)
        .bind(token_to_db(expected.fencing_token)?)
        .bind(expected.expires_at.to_rfc3339())
        .bind(expected.released)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self) -> DomainResult<Vec<LockLease>> {
        let rows: Vec<LeaseRow> = sqlx::query_as(
            "SELECT workflow_id, holder_id, fencing_token, acquired_at, expires_at, released
             FROM workflow_leases ORDER BY workflow_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    workflow_id: String,
    holder_id: String,
    fencing_token: i64,
    acquired_at: String,
    expires_at: String,
    released: bool,
}

impl TryFrom<LeaseRow> for LockLease {
    type Error = DomainError;

    fn try_from(row: LeaseRow) -> Result<Self, Self::Error> {
        let fencing_token = u64::try_from(row.fencing_token)
            .map_err(|_| DomainError::SerializationError(format!("negative fencing token {}", row.fencing_token)))?;

        Ok(LockLease {
            workflow_id: row.workflow_id,
            holder_id: row.holder_id,
            acquired_at: parse_datetime(&row.acquired_at)?,
            expires_at: parse_datetime(&row.expires_at)?,
            fencing_token,
            released: row.released,
        })
    }
}
