//! SQLite implementation of the CheckpointStore.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_optional_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CheckpointMetadata, CheckpointRecord, CheckpointType, WorkflowState};
use crate::domain::ports::CheckpointStore;

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str =
    "SELECT checkpoint_id, workflow_id, checkpoint_type, state_json, metadata_json, created_at, expires_at FROM checkpoints";

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, record: &CheckpointRecord) -> DomainResult<()> {
        let state_json = serde_json::to_string(&record.state_snapshot)?;
        let metadata_json = serde_json::to_string(&record.metadata)?;

        sqlx::query(
            "INSERT INTO checkpoints (checkpoint_id, workflow_id, checkpoint_type, current_stage,
                                      state_json, metadata_json, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.checkpoint_id.to_string())
        .bind(&record.workflow_id)
        .bind(record.checkpoint_type.as_str())
        .bind(record.state_snapshot.current_stage.as_str())
        .bind(&state_json)
        .bind(&metadata_json)
        .bind(record.created_at.to_rfc3339())
        .bind(record.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, checkpoint_id: Uuid) -> DomainResult<Option<CheckpointRecord>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE checkpoint_id = ?"))
            .bind(checkpoint_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn latest(&self, workflow_id: &str) -> DomainResult<Option<CheckpointRecord>> {
        let row: Option<CheckpointRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE workflow_id = ? ORDER BY seq DESC LIMIT 1"))
                .bind(workflow_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, workflow_id: &str) -> DomainResult<Vec<CheckpointRecord>> {
        let rows: Vec<CheckpointRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE workflow_id = ? ORDER BY seq ASC"))
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete(&self, workflow_id: &str, checkpoint_ids: &[Uuid]) -> DomainResult<usize> {
        if checkpoint_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for id in checkpoint_ids {
            let result = sqlx::query("DELETE FROM checkpoints WHERE workflow_id = ? AND checkpoint_id = ?")
                .bind(workflow_id)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;

        usize::try_from(deleted).map_err(|e| DomainError::Persistence(e.to_string()))
    }

    async fn workflow_ids(&self) -> DomainResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT workflow_id FROM checkpoints ORDER BY workflow_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn ping(&self) -> DomainResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    checkpoint_id: String,
    workflow_id: String,
    checkpoint_type: String,
    state_json: String,
    metadata_json: String,
    created_at: String,
    expires_at: Option<String>,
}

impl TryFrom<CheckpointRow> for CheckpointRecord {
    type Error = DomainError;

    fn try_from(row: CheckpointRow) -> Result<Self, Self::Error> {
        let state_snapshot: WorkflowState = serde_json::from_str(&row.state_json)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&row.metadata_json)?;

        Ok(CheckpointRecord {
            checkpoint_id: parse_uuid(&row.checkpoint_id)?,
            workflow_id: row.workflow_id,
            checkpoint_type: row.checkpoint_type.parse::<CheckpointType>()?,
            state_snapshot,
            metadata,
            created_at: parse_datetime(&row.created_at)?,
            expires_at: parse_optional_datetime(row.expires_at)?,
        })
    }
}
