//! Caller-facing facade over the supervisor, checkpoints and leases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::sqlite::{SqliteCheckpointStore, SqliteLeaseStore};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CheckpointMetadata, CheckpointRecord, CheckpointType, Config, LockLease, PruneReport, RetentionPolicy, Stage,
    WorkflowInput, WorkflowState,
};
use crate::domain::ports::{CheckpointStore, LeaseStore, RetryObserver};
use crate::services::checkpoint_manager::CheckpointManager;
use crate::services::lock_manager::LockManager;
use crate::services::pipeline_supervisor::{PipelineSupervisor, RunOutcome, SupervisorSettings};
use crate::services::retry_executor::{CancellationFlag, RetryExecutor};
use crate::services::stage_registry::StageRegistry;

/// Snapshot of service health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    pub registered_stages: Vec<Stage>,
    pub active_runs: usize,
    pub checked_at: DateTime<Utc>,
}

type ActiveRuns = Arc<Mutex<HashMap<String, CancellationFlag>>>;

/// Removes a run's cancellation flag when the run ends, however it ends.
struct ActiveRunGuard {
    runs: ActiveRuns,
    workflow_id: String,
    flag: CancellationFlag,
}

impl ActiveRunGuard {
    fn register(runs: &ActiveRuns, workflow_id: &str) -> Self {
        let flag = CancellationFlag::new();
        if let Ok(mut active) = runs.lock() {
            active.entry(workflow_id.to_string()).or_insert_with(|| flag.clone());
        }
        Self {
            runs: Arc::clone(runs),
            workflow_id: workflow_id.to_string(),
            flag,
        }
    }
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.runs.lock() {
            if active.get(&self.workflow_id).is_some_and(|f| f.same_as(&self.flag)) {
                active.remove(&self.workflow_id);
            }
        }
    }
}

/// Entry point for starting, inspecting and repairing workflows.
pub struct WorkflowService {
    supervisor: PipelineSupervisor,
    checkpoints: Arc<CheckpointManager>,
    locks: Arc<LockManager>,
    registry: StageRegistry,
    retention: RetentionPolicy,
    active: ActiveRuns,
}

impl WorkflowService {
    pub fn new(
        checkpoint_store: Arc<dyn CheckpointStore>,
        lease_store: Arc<dyn LeaseStore>,
        registry: StageRegistry,
        config: &Config,
    ) -> Self {
        Self::with_parts(
            checkpoint_store,
            lease_store,
            registry,
            config,
            SupervisorSettings::from_config(config),
            RetryExecutor::default(),
        )
    }

    /// Service backed by the SQLite stores on `pool`.
    pub fn sqlite(pool: SqlitePool, registry: StageRegistry, config: &Config) -> Self {
        Self::new(
            Arc::new(SqliteCheckpointStore::new(pool.clone())),
            Arc::new(SqliteLeaseStore::new(pool)),
            registry,
            config,
        )
    }

    pub fn with_parts(
        checkpoint_store: Arc<dyn CheckpointStore>,
        lease_store: Arc<dyn LeaseStore>,
        registry: StageRegistry,
        config: &Config,
        settings: SupervisorSettings,
        executor: RetryExecutor,
    ) -> Self {
        let retention = config.checkpoint.retention_policy();
        let checkpoints = Arc::new(
            CheckpointManager::new(checkpoint_store, retention.clone())
                .with_prune_on_save(config.checkpoint.prune_on_save),
        );
        let locks = Arc::new(LockManager::new(lease_store));
        let supervisor = PipelineSupervisor::new(Arc::clone(&checkpoints), Arc::clone(&locks), executor, settings);

        Self {
            supervisor,
            checkpoints,
            locks,
            registry,
            retention,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Same service with failed attempts reported to `observer`.
    pub fn with_retry_observer(self, observer: Arc<dyn RetryObserver>) -> Self {
        let settings = self.supervisor.settings().clone();
        let supervisor = PipelineSupervisor::new(
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.locks),
            RetryExecutor::new(observer),
            settings,
        );
        Self { supervisor, ..self }
    }

    /// Run `workflow_id` from its latest checkpoint, or from scratch with `input`.
    ///
    /// Fails with `WorkflowBusy` while another execution holds the workflow.
    pub async fn start_or_resume(&self, workflow_id: &str, input: WorkflowInput) -> DomainResult<RunOutcome> {
        if workflow_id.trim().is_empty() {
            return Err(DomainError::ValidationFailed("workflow id cannot be empty".to_string()));
        }
        let guard = ActiveRunGuard::register(&self.active, workflow_id);
        self.supervisor
            .run(workflow_id, input, &self.registry, guard.flag.clone())
            .await
    }

    /// State held by the latest checkpoint.
    pub async fn get_status(&self, workflow_id: &str) -> DomainResult<WorkflowState> {
        self.checkpoints
            .latest(workflow_id)
            .await?
            .map(|record| record.state_snapshot)
            .ok_or_else(|| DomainError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn list_checkpoints(&self, workflow_id: &str) -> DomainResult<Vec<CheckpointRecord>> {
        self.checkpoints.list(workflow_id).await
    }

    /// Make `checkpoint_id` the resume point of the workflow.
    ///
    /// The restored state is written as a new `manual` checkpoint; nothing is
    /// deleted. Busy workflows cannot be rolled back.
    pub async fn rollback(&self, workflow_id: &str, checkpoint_id: Uuid) -> DomainResult<WorkflowState> {
        self.with_lease(workflow_id, "rollback", || async {
            let restored = self.checkpoints.rollback(workflow_id, checkpoint_id).await?;
            let metadata = CheckpointMetadata::from([
                ("rolled_back_from".to_string(), json!(checkpoint_id.to_string())),
                ("stage".to_string(), json!(restored.current_stage)),
            ]);
            self.checkpoints
                .save(workflow_id, CheckpointType::Manual, &restored, metadata)
                .await?;
            info!(
                workflow_id,
                checkpoint_id = %checkpoint_id,
                stage = %restored.current_stage,
                "Workflow rolled back"
            );
            Ok(restored)
        })
        .await
    }

    /// Delete every checkpoint of a workflow, forgetting it entirely.
    ///
    /// Takes the lease like [`rollback`](Self::rollback), so a running
    /// workflow cannot lose its history mid-run.
    pub async fn delete_checkpoints(&self, workflow_id: &str) -> DomainResult<usize> {
        self.with_lease(workflow_id, "delete", || async {
            let deleted = self.checkpoints.delete_all(workflow_id).await?;
            if deleted == 0 {
                return Err(DomainError::WorkflowNotFound(workflow_id.to_string()));
            }
            warn!(workflow_id, deleted, "Workflow checkpoints deleted");
            Ok(deleted)
        })
        .await
    }

    /// Ask the in-process run of `workflow_id` to stop after its current attempt.
    ///
    /// `false` when no run of that workflow is active in this process.
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let Ok(active) = self.active.lock() else {
            return false;
        };
        match active.get(workflow_id) {
            Some(flag) => {
                flag.cancel();
                info!(workflow_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Manual checkpoint of the current status. Never changes the stage.
    pub async fn snapshot(&self, workflow_id: &str, note: Option<String>) -> DomainResult<Uuid> {
        self.with_lease(workflow_id, "snapshot", || async {
            let state = self.get_status(workflow_id).await?;
            let mut metadata = CheckpointMetadata::from([("stage".to_string(), json!(state.current_stage))]);
            if let Some(note) = note {
                metadata.insert("note".to_string(), json!(note));
            }
            self.checkpoints
                .save(workflow_id, CheckpointType::Manual, &state, metadata)
                .await
        })
        .await
    }

    /// Latest state of every known workflow, optionally only those at `stage`.
    pub async fn list_workflows(&self, stage: Option<Stage>) -> DomainResult<Vec<WorkflowState>> {
        let ids = self.checkpoints.workflow_ids().await?;
        let latest = try_join_all(ids.iter().map(|id| self.checkpoints.latest(id))).await?;

        Ok(latest
            .into_iter()
            .flatten()
            .map(|record| record.state_snapshot)
            .filter(|state| stage.is_none_or(|s| state.current_stage == s))
            .collect())
    }

    pub async fn prune(&self, workflow_id: &str) -> DomainResult<PruneReport> {
        self.checkpoints.prune(workflow_id, &self.retention).await
    }

    pub async fn prune_all(&self) -> DomainResult<PruneReport> {
        self.checkpoints.prune_all(&self.retention).await
    }

    pub async fn locks(&self) -> DomainResult<Vec<LockLease>> {
        Ok(self.locks.list().await?)
    }

    /// Operator override for a lease left behind by a dead process.
    pub async fn unlock(&self, workflow_id: &str) -> DomainResult<bool> {
        Ok(self.locks.force_release(workflow_id).await?)
    }

    pub async fn health(&self) -> HealthReport {
        let store_reachable = match self.checkpoints.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Checkpoint store unreachable");
                false
            }
        };
        let active_runs = self.active.lock().map(|active| active.len()).unwrap_or_default();

        HealthReport {
            healthy: store_reachable,
            store_reachable,
            registered_stages: self.registry.stages(),
            active_runs,
            checked_at: Utc::now(),
        }
    }

    /// Run `op` while holding the workflow lease under a one-off holder id.
    async fn with_lease<T, F, Fut>(&self, workflow_id: &str, purpose: &str, op: F) -> DomainResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DomainResult<T>>,
    {
        let settings = self.supervisor.settings();
        let holder_id = format!("{}/{purpose}-{}", settings.instance_id, Uuid::new_v4());
        let lease = self
            .locks
            .acquire(workflow_id, &holder_id, settings.lease_duration)
            .await?;

        let result = op().await;

        if let Err(e) = self.locks.release(&lease).await {
            warn!(workflow_id, error = %e, "Failed to release lease");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryCheckpointStore, InMemoryLeaseStore};
    use crate::domain::ports::StageFn;

    fn service(registry: StageRegistry) -> WorkflowService {
        WorkflowService::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryLeaseStore::new()),
            registry,
            &Config::default(),
        )
    }

    fn registry() -> StageRegistry {
        let mut registry = StageRegistry::new();
        for stage in Stage::PIPELINE {
            registry
                .register(stage, Arc::new(StageFn::new(move |_| async move { Ok(json!(stage)) })))
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_status_of_unknown_workflow() {
        let service = service(registry());
        let err = service.get_status("nope").await.unwrap_err();
        assert!(matches!(err, DomainError::WorkflowNotFound(_)));
        assert!(service.list_checkpoints("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_then_status() {
        let service = service(registry());
        let outcome = service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
        assert!(outcome.is_completed());

        let status = service.get_status("wf-1").await.unwrap();
        assert_eq!(status.current_stage, Stage::Done);
        assert_eq!(service.list_workflows(Some(Stage::Done)).await.unwrap().len(), 1);
        assert!(service.list_workflows(Some(Stage::Research)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_active_run() {
        let service = service(registry());
        assert!(!service.cancel("wf-1"));
    }

    #[tokio::test]
    async fn test_empty_workflow_id_rejected() {
        let service = service(registry());
        let err = service.start_or_resume(" ", WorkflowInput::new("ai")).await.unwrap_err();
        assert!(matches!(err, DomainError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn test_snapshot_keeps_stage() {
        let service = service(registry());
        service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();

        let id = service.snapshot("wf-1", Some("before upgrade".to_string())).await.unwrap();
        let latest = service.list_checkpoints("wf-1").await.unwrap().pop().unwrap();
        assert_eq!(latest.checkpoint_id, id);
        assert_eq!(latest.checkpoint_type, CheckpointType::Manual);
        assert_eq!(latest.metadata.get("note"), Some(&json!("before upgrade")));
        assert_eq!(latest.state_snapshot.current_stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_retry_observer_sees_failed_attempts() {
        use crate::domain::ports::{RetryContext, StageError};
        use std::sync::atomic::{AtomicU32, Ordering};

        #[derive(Default)]
        struct Counting(AtomicU32);

        impl RetryObserver for Counting {
            fn on_attempt_failed(&self, _context: &RetryContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut registry = registry();
        registry
            .register(
                Stage::Research,
                Arc::new(StageFn::new(|_| async { Err(StageError::fatal("no sources")) })),
            )
            .unwrap();
        let observer = Arc::new(Counting::default());
        let service = service(registry).with_retry_observer(observer.clone());

        let outcome = service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_checkpoints_forgets_workflow() {
        let service = service(registry());
        service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();

        assert_eq!(service.delete_checkpoints("wf-1").await.unwrap(), 5);
        assert!(matches!(
            service.get_status("wf-1").await.unwrap_err(),
            DomainError::WorkflowNotFound(_)
        ));
        assert!(matches!(
            service.delete_checkpoints("wf-1").await.unwrap_err(),
            DomainError::WorkflowNotFound(_)
        ));

        // the next run starts from scratch
        let outcome = service.start_or_resume("wf-1", WorkflowInput::new("ml")).await.unwrap();
        assert_eq!(outcome.state().input.keyword, "ml");
    }

    #[tokio::test]
    async fn test_health_report() {
        let service = service(registry());
        let report = service.health().await;
        assert!(report.healthy);
        assert!(report.store_reachable);
        assert_eq!(report.registered_stages, Stage::PIPELINE.to_vec());
        assert_eq!(report.active_runs, 0);
    }
}
