//! Checkpoint creation, retention and restore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CheckpointMetadata, CheckpointRecord, CheckpointType, PruneReport, RetentionPolicy, WorkflowState,
};
use crate::domain::ports::CheckpointStore;

/// Builds, deduplicates, prunes and restores checkpoints on top of a
/// [`CheckpointStore`].
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    policy: RetentionPolicy,
    prune_on_save: bool,
    /// Workflows with a prune in flight, and whether another pass was requested meanwhile.
    pruning: Arc<Mutex<HashMap<String, bool>>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, policy: RetentionPolicy) -> Self {
        Self {
            store,
            policy,
            prune_on_save: true,
            pruning: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_prune_on_save(mut self, enabled: bool) -> Self {
        self.prune_on_save = enabled;
        self
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Persist a snapshot of `state`.
    ///
    /// If the latest record already holds the same type, snapshot and
    /// metadata, its id is returned and nothing is written.
    pub async fn save(
        &self,
        workflow_id: &str,
        checkpoint_type: CheckpointType,
        state: &WorkflowState,
        metadata: CheckpointMetadata,
    ) -> DomainResult<Uuid> {
        if state.workflow_id != workflow_id {
            return Err(DomainError::ValidationFailed(format!(
                "snapshot belongs to workflow {}, not {workflow_id}",
                state.workflow_id
            )));
        }

        let latest = self.store.latest(workflow_id).await?;
        let now = Utc::now();
        let created_at = latest.as_ref().map_or(now, |l| l.created_at.max(now));
        let record = CheckpointRecord::new(checkpoint_type, state.clone(), metadata, created_at)
            .with_expiry(self.expiry_for(created_at));

        if let Some(latest) = latest.filter(|l| l.same_content(&record)) {
            debug!(
                workflow_id,
                checkpoint_id = %latest.checkpoint_id,
                checkpoint_type = %checkpoint_type,
                "Checkpoint unchanged, skipping write"
            );
            return Ok(latest.checkpoint_id);
        }

        self.store.append(&record).await?;
        debug!(
            workflow_id,
            checkpoint_id = %record.checkpoint_id,
            checkpoint_type = %checkpoint_type,
            stage = %state.current_stage,
            "Checkpoint saved"
        );

        if self.prune_on_save {
            self.schedule_prune(workflow_id);
        }
        Ok(record.checkpoint_id)
    }

    pub async fn latest(&self, workflow_id: &str) -> DomainResult<Option<CheckpointRecord>> {
        self.store.latest(workflow_id).await
    }

    /// A record of `workflow_id`; records of other workflows are not found.
    pub async fn get(&self, workflow_id: &str, checkpoint_id: Uuid) -> DomainResult<CheckpointRecord> {
        self.store
            .get(checkpoint_id)
            .await?
            .filter(|record| record.workflow_id == workflow_id)
            .ok_or_else(|| DomainError::CheckpointNotFound {
                workflow_id: workflow_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })
    }

    /// Records of a workflow, oldest first.
    pub async fn list(&self, workflow_id: &str) -> DomainResult<Vec<CheckpointRecord>> {
        self.store.list(workflow_id).await
    }

    /// Reconstruct the state held by a checkpoint. Nothing is written.
    pub async fn rollback(&self, workflow_id: &str, checkpoint_id: Uuid) -> DomainResult<WorkflowState> {
        let record = self.get(workflow_id, checkpoint_id).await?;
        info!(
            workflow_id,
            checkpoint_id = %checkpoint_id,
            stage = %record.state_snapshot.current_stage,
            "Restoring workflow state from checkpoint"
        );
        Ok(record.state_snapshot.restored())
    }

    pub async fn prune(&self, workflow_id: &str, policy: &RetentionPolicy) -> DomainResult<PruneReport> {
        prune_workflow(self.store.as_ref(), workflow_id, policy).await
    }

    /// Prune every workflow with checkpoints.
    pub async fn prune_all(&self, policy: &RetentionPolicy) -> DomainResult<PruneReport> {
        let mut report = PruneReport::default();
        for workflow_id in self.store.workflow_ids().await? {
            report.merge(&prune_workflow(self.store.as_ref(), &workflow_id, policy).await?);
        }
        if report.deleted > 0 {
            info!(
                workflows = report.workflows_scanned,
                deleted = report.deleted,
                "Pruned expired checkpoints"
            );
        }
        Ok(report)
    }

    /// Remove every checkpoint of a workflow. Returns how many were removed.
    pub async fn delete_all(&self, workflow_id: &str) -> DomainResult<usize> {
        let ids: Vec<Uuid> = self
            .store
            .list(workflow_id)
            .await?
            .into_iter()
            .map(|record| record.checkpoint_id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete(workflow_id, &ids).await?;
        info!(workflow_id, deleted, "Deleted workflow checkpoints");
        Ok(deleted)
    }

    pub async fn workflow_ids(&self) -> DomainResult<Vec<String>> {
        self.store.workflow_ids().await
    }

    pub async fn ping(&self) -> DomainResult<()> {
        self.store.ping().await
    }

    fn expiry_for(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.policy
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| created_at + age)
    }

    /// Prune in the background, at most one pass in flight per workflow.
    ///
    /// A save that lands while a pass is running asks that pass to go again.
    fn schedule_prune(&self, workflow_id: &str) {
        {
            let Ok(mut pruning) = self.pruning.lock() else {
                return;
            };
            if let Some(rerun) = pruning.get_mut(workflow_id) {
                *rerun = true;
                return;
            }
            pruning.insert(workflow_id.to_string(), false);
        }

        let store = Arc::clone(&self.store);
        let pruning = Arc::clone(&self.pruning);
        let policy = self.policy.clone();
        let workflow_id = workflow_id.to_string();

        tokio::spawn(async move {
            loop {
                if let Err(e) = prune_workflow(store.as_ref(), &workflow_id, &policy).await {
                    warn!(workflow_id = %workflow_id, error = %e, "Background checkpoint prune failed");
                }
                let Ok(mut in_flight) = pruning.lock() else {
                    break;
                };
                match in_flight.get_mut(&workflow_id) {
                    Some(rerun) if *rerun => *rerun = false,
                    _ => {
                        in_flight.remove(&workflow_id);
                        break;
                    }
                }
            }
        });
    }
}

async fn prune_workflow(
    store: &dyn CheckpointStore,
    workflow_id: &str,
    policy: &RetentionPolicy,
) -> DomainResult<PruneReport> {
    let records = store.list(workflow_id).await?;
    let doomed = select_prunable(&records, policy, Utc::now());
    let deleted = if doomed.is_empty() {
        0
    } else {
        store.delete(workflow_id, &doomed).await?
    };
    if deleted > 0 {
        debug!(workflow_id, deleted, "Pruned checkpoints");
    }
    Ok(PruneReport {
        workflows_scanned: 1,
        deleted,
    })
}

/// Ids of `records` (oldest first) that `policy` allows deleting at `now`.
///
/// The newest record and the newest `stage_completion` record are always kept.
pub fn select_prunable(records: &[CheckpointRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<Uuid> {
    let Some(last) = records.last() else {
        return Vec::new();
    };
    let last_completion = records
        .iter()
        .rev()
        .find(|r| r.checkpoint_type == CheckpointType::StageCompletion)
        .map(|r| r.checkpoint_id);
    let cutoff = policy
        .max_age
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .map(|age| now - age);
    let overflow = records.len().saturating_sub(policy.max_per_workflow);

    records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.checkpoint_id != last.checkpoint_id && Some(r.checkpoint_id) != last_completion)
        .filter(|(index, r)| *index < overflow || cutoff.is_some_and(|cutoff| r.created_at < cutoff))
        .map(|(_, r)| r.checkpoint_id)
        .collect()
}
