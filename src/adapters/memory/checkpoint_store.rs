//! In-memory CheckpointStore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::CheckpointRecord;
use crate::domain::ports::CheckpointStore;

/// Process-local checkpoint store.
///
/// Records vanish with the process. Writes can be made to fail on demand,
/// which is how persistence failures are exercised.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, Vec<CheckpointRecord>>>,
    fail_appends: AtomicBool,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append` fail (or succeed again).
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Total records across all workflows.
    pub async fn len(&self) -> usize {
        self.records.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, record: &CheckpointRecord) -> DomainResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(DomainError::Persistence("checkpoint store unavailable".to_string()));
        }
        let mut records = self.records.write().await;
        records
            .entry(record.workflow_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn get(&self, checkpoint_id: Uuid) -> DomainResult<Option<CheckpointRecord>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .flatten()
            .find(|r| r.checkpoint_id == checkpoint_id)
            .cloned())
    }

    async fn latest(&self, workflow_id: &str) -> DomainResult<Option<CheckpointRecord>> {
        let records = self.records.read().await;
        Ok(records.get(workflow_id).and_then(|list| list.last()).cloned())
    }

    async fn list(&self, workflow_id: &str) -> DomainResult<Vec<CheckpointRecord>> {
        let records = self.records.read().await;
        Ok(records.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn delete(&self, workflow_id: &str, checkpoint_ids: &[Uuid]) -> DomainResult<usize> {
        let mut records = self.records.write().await;
        let Some(list) = records.get_mut(workflow_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|r| !checkpoint_ids.contains(&r.checkpoint_id));
        let deleted = before - list.len();
        if list.is_empty() {
            records.remove(workflow_id);
        }
        Ok(deleted)
    }

    async fn workflow_ids(&self) -> DomainResult<Vec<String>> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> DomainResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{CheckpointMetadata, CheckpointType, WorkflowInput, WorkflowState};
    use chrono::Utc;

    fn record(workflow_id: &str) -> CheckpointRecord {
        let state = WorkflowState::new(workflow_id, WorkflowInput::new("ai"));
        CheckpointRecord::new(CheckpointType::Periodic, state, CheckpointMetadata::new(), Utc::now())
    }

    #[tokio::test]
    async fn test_append_list_delete() {
        let store = InMemoryCheckpointStore::new();
        let a = record("wf-1");
        let b = record("wf-1");
        store.append(&a).await.unwrap();
        store.append(&b).await.unwrap();

        assert_eq!(store.latest("wf-1").await.unwrap().unwrap().checkpoint_id, b.checkpoint_id);
        assert_eq!(store.get(a.checkpoint_id).await.unwrap(), Some(a.clone()));
        assert_eq!(store.delete("wf-1", &[a.checkpoint_id, b.checkpoint_id]).await.unwrap(), 2);
        assert!(store.is_empty().await);
        assert!(store.workflow_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_appends() {
        let store = InMemoryCheckpointStore::new();
        store.set_fail_appends(true);
        let err = store.append(&record("wf-1")).await.unwrap_err();
        assert!(err.is_persistence());

        store.set_fail_appends(false);
        store.append(&record("wf-1")).await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
