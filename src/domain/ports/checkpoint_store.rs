//! Checkpoint store port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::CheckpointRecord;

/// Append-only persistence for checkpoint records.
///
/// Implementations must accept concurrent appends for different workflow ids
/// and return each workflow's records in insertion order.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a record. Records are never updated in place.
    async fn append(&self, record: &CheckpointRecord) -> DomainResult<()>;

    /// Get a record by id, whichever workflow it belongs to.
    async fn get(&self, checkpoint_id: Uuid) -> DomainResult<Option<CheckpointRecord>>;

    /// Most recently appended record for a workflow.
    async fn latest(&self, workflow_id: &str) -> DomainResult<Option<CheckpointRecord>>;

    /// All records for a workflow, oldest first.
    async fn list(&self, workflow_id: &str) -> DomainResult<Vec<CheckpointRecord>>;

    /// Delete the given records of a workflow. Returns how many were removed.
    async fn delete(&self, workflow_id: &str, checkpoint_ids: &[Uuid]) -> DomainResult<usize>;

    /// Every workflow id with at least one record.
    async fn workflow_ids(&self) -> DomainResult<Vec<String>>;

    /// Cheap reachability check.
    async fn ping(&self) -> DomainResult<()>;
}
