//! Pipeline supervisor: drives one workflow through its stages.
//!
//! A run takes the workflow lease, resumes from the latest checkpoint (or
//! starts fresh), executes every remaining stage through the retry executor
//! and checkpoints each completed stage before moving on. The lease is always
//! released before the run returns.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CheckpointMetadata, CheckpointType, Config, LockLease, Stage, StageFailure, WorkflowInput, WorkflowState,
};
use crate::services::checkpoint_manager::CheckpointManager;
use crate::services::heartbeat::{spawn_heartbeat, HeartbeatConfig, HeartbeatHandle, RunLedger};
use crate::services::lock_manager::LockManager;
use crate::services::retry_executor::{Attempted, CancellationFlag, RetryError, RetryExecutor, RetryPolicy, RetryScope};
use crate::services::stage_registry::StageRegistry;

/// Identifies this process in lease holder ids.
pub fn default_instance_id() -> String {
    format!("kgflow-{}", std::process::id())
}

/// Timing and retry settings for supervisor runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    /// Prefix of every run's holder id.
    pub instance_id: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub periodic_interval: Duration,
    pub retry_policy: RetryPolicy,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: default_instance_id(),
            lease_duration: Duration::from_millis(config.lease.duration_ms),
            renew_interval: Duration::from_millis(config.lease.renew_interval_ms),
            periodic_interval: Duration::from_millis(config.checkpoint.periodic_interval_ms),
            retry_policy: RetryPolicy::from(&config.retry),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            lease_duration: self.lease_duration,
            renew_interval: self.renew_interval,
            periodic_interval: self.periodic_interval,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// How a run ended, when it ended without an infrastructure error.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every stage completed.
    Completed(WorkflowState),
    /// A stage failed fatally or ran out of attempts; the workflow is now `failed`.
    Failed { state: WorkflowState, error: DomainError },
    /// Cancelled between attempts; resumable from the same stage.
    Cancelled(WorkflowState),
}

impl RunOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            Self::Completed(state) | Self::Cancelled(state) | Self::Failed { state, .. } => state,
        }
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            Self::Completed(state) | Self::Cancelled(state) | Self::Failed { state, .. } => state,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

enum Prepared {
    /// Already `done`; nothing to execute.
    Finished(WorkflowState),
    Resume(WorkflowState),
}

/// The workflow state machine.
pub struct PipelineSupervisor {
    checkpoints: Arc<CheckpointManager>,
    locks: Arc<LockManager>,
    executor: RetryExecutor,
    settings: SupervisorSettings,
}

impl PipelineSupervisor {
    pub fn new(
        checkpoints: Arc<CheckpointManager>,
        locks: Arc<LockManager>,
        executor: RetryExecutor,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            checkpoints,
            locks,
            executor,
            settings,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Start or resume `workflow_id`.
    ///
    /// `input` is only used when the workflow has no checkpoint yet.
    #[instrument(
        name = "workflow_run",
        skip_all,
        fields(
            workflow_id = %workflow_id,
            trace_id = tracing::field::Empty,
            fencing_token = tracing::field::Empty
        )
    )]
    pub async fn run(
        &self,
        workflow_id: &str,
        input: WorkflowInput,
        handlers: &StageRegistry,
        cancel: CancellationFlag,
    ) -> DomainResult<RunOutcome> {
        let holder_id = format!("{}/{}", self.settings.instance_id, Uuid::new_v4());
        let lease = self
            .locks
            .acquire(workflow_id, &holder_id, self.settings.lease_duration)
            .await
            .map_err(DomainError::from)
            .inspect_err(|e| {
                if e.is_busy() {
                    info!(error = %e, "Workflow busy, not starting");
                }
            })?;
        Span::current().record("fencing_token", lease.fencing_token);

        let state = match self.prepare(workflow_id, input, handlers).await {
            Ok(Prepared::Resume(state)) => state,
            Ok(Prepared::Finished(state)) => {
                info!("Workflow already done");
                self.release(&lease).await;
                return Ok(RunOutcome::Completed(state));
            }
            Err(e) => {
                self.release(&lease).await;
                return Err(e);
            }
        };
        Span::current().record("trace_id", tracing::field::display(state.trace_id));
        info!(
            stage = %state.current_stage,
            completed = state.results.len(),
            "Running workflow"
        );

        let ledger = Arc::new(Mutex::new(RunLedger::new(state)));
        let heartbeat = spawn_heartbeat(
            lease,
            Arc::clone(&ledger),
            Arc::clone(&self.locks),
            Arc::clone(&self.checkpoints),
            self.settings.heartbeat(),
        );

        let result = self.drive(workflow_id, handlers, &cancel, &ledger, &heartbeat).await;

        let lease = heartbeat.stop().await;
        self.release(&lease).await;

        match &result {
            Ok(outcome) => info!(
                outcome = outcome.label(),
                stage = %outcome.state().current_stage,
                "Workflow run finished"
            ),
            Err(e) => error!(error = %e, "Workflow run aborted"),
        }
        result
    }

    async fn prepare(
        &self,
        workflow_id: &str,
        input: WorkflowInput,
        handlers: &StageRegistry,
    ) -> DomainResult<Prepared> {
        let state = match self.checkpoints.latest(workflow_id).await? {
            Some(record) => {
                debug!(
                    checkpoint_id = %record.checkpoint_id,
                    checkpoint_type = %record.checkpoint_type,
                    stage = %record.state_snapshot.current_stage,
                    "Resuming from checkpoint"
                );
                record.state_snapshot
            }
            None => WorkflowState::new(workflow_id, input),
        };

        match state.current_stage {
            Stage::Done => return Ok(Prepared::Finished(state)),
            Stage::Failed => {
                return Err(DomainError::WorkflowFailed {
                    workflow_id: workflow_id.to_string(),
                    stage: state.failure.as_ref().map_or(Stage::Failed, |f| f.stage),
                })
            }
            _ => {}
        }

        if let Some(stage) = handlers.missing(&state.remaining_stages()).first() {
            warn!(stage = %stage, "No handler registered for remaining stage");
            return Err(DomainError::UnsupportedStage(*stage));
        }
        Ok(Prepared::Resume(state))
    }

    async fn drive(
        &self,
        workflow_id: &str,
        handlers: &StageRegistry,
        cancel: &CancellationFlag,
        ledger: &Arc<Mutex<RunLedger>>,
        heartbeat: &HeartbeatHandle,
    ) -> DomainResult<RunOutcome> {
        let pending = ledger.lock().await.state.remaining_stages();

        for stage in pending {
            heartbeat.check(workflow_id)?;
            if cancel.is_cancelled() {
                return self.record_cancellation(workflow_id, stage, 0, ledger, heartbeat).await;
            }

            let registered = handlers.get(stage).ok_or(DomainError::UnsupportedStage(stage))?;
            let policy = self
                .settings
                .retry_policy
                .clone()
                .with_timeout_override(registered.timeout);
            let snapshot = ledger.lock().await.state.clone();
            let handler = Arc::clone(&registered.handler);

            debug!(stage = %stage, max_attempts = policy.max_attempts, "Executing stage");
            let result = self
                .executor
                .execute(&RetryScope::new(workflow_id, stage), &policy, cancel, || {
                    let handler = Arc::clone(&handler);
                    let snapshot = snapshot.clone();
                    async move { handler.execute(&snapshot).await }
                })
                .await;

            match result {
                Ok(Attempted { value, attempts }) => {
                    self.commit_stage(workflow_id, stage, value, attempts, ledger, heartbeat)
                        .await?;
                }
                Err(RetryError::Cancelled { attempts }) => {
                    return self
                        .record_cancellation(workflow_id, stage, attempts, ledger, heartbeat)
                        .await;
                }
                Err(RetryError::Fatal { attempts, error }) => {
                    let cause = DomainError::Fatal {
                        stage,
                        message: error.clone(),
                    };
                    return self
                        .record_failure(workflow_id, stage, attempts, error, cause, ledger, heartbeat)
                        .await;
                }
                Err(RetryError::Exhausted { attempts, last_error }) => {
                    let cause = DomainError::ExhaustedRetries {
                        stage,
                        attempts,
                        last_error: last_error.clone(),
                    };
                    return self
                        .record_failure(workflow_id, stage, attempts, last_error, cause, ledger, heartbeat)
                        .await;
                }
            }
        }

        let mut guard = ledger.lock().await;
        guard.sealed = true;
        Ok(RunOutcome::Completed(guard.state.clone()))
    }

    /// Record a stage payload: checkpoint first, then make it the committed state.
    async fn commit_stage(
        &self,
        workflow_id: &str,
        stage: Stage,
        payload: serde_json::Value,
        attempts: u32,
        ledger: &Mutex<RunLedger>,
        heartbeat: &HeartbeatHandle,
    ) -> DomainResult<()> {
        let mut guard = ledger.lock().await;
        let mut next = guard.state.clone();
        next.complete_stage(stage, payload)?;
        self.fence(workflow_id, heartbeat).await?;

        let metadata = CheckpointMetadata::from([
            ("stage".to_string(), json!(stage)),
            ("attempts".to_string(), json!(attempts)),
        ]);
        self.checkpoints
            .save(workflow_id, CheckpointType::StageCompletion, &next, metadata)
            .await?;

        info!(stage = %stage, attempts, next_stage = %next.current_stage, "Stage completed");
        guard.sealed = next.current_stage == Stage::Done;
        guard.state = next;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_failure(
        &self,
        workflow_id: &str,
        stage: Stage,
        attempts: u32,
        message: String,
        cause: DomainError,
        ledger: &Mutex<RunLedger>,
        heartbeat: &HeartbeatHandle,
    ) -> DomainResult<RunOutcome> {
        let mut guard = ledger.lock().await;
        let mut failed = guard.state.clone();
        failed.mark_failed(StageFailure {
            stage,
            error: message.clone(),
            attempts,
        })?;
        self.fence(workflow_id, heartbeat).await?;

        let metadata = CheckpointMetadata::from([
            ("stage".to_string(), json!(stage)),
            ("error".to_string(), json!(message)),
            ("attempts".to_string(), json!(attempts)),
        ]);
        self.checkpoints
            .save(workflow_id, CheckpointType::ErrorRecovery, &failed, metadata)
            .await?;

        error!(stage = %stage, attempts, error = %cause, "Workflow failed");
        guard.state = failed.clone();
        guard.sealed = true;
        Ok(RunOutcome::Failed {
            state: failed,
            error: cause,
        })
    }

    async fn record_cancellation(
        &self,
        workflow_id: &str,
        stage: Stage,
        attempts: u32,
        ledger: &Mutex<RunLedger>,
        heartbeat: &HeartbeatHandle,
    ) -> DomainResult<RunOutcome> {
        let mut guard = ledger.lock().await;
        self.fence(workflow_id, heartbeat).await?;
        let metadata = CheckpointMetadata::from([
            ("cancelled".to_string(), json!(true)),
            ("stage".to_string(), json!(stage)),
            ("attempts".to_string(), json!(attempts)),
        ]);
        self.checkpoints
            .save(workflow_id, CheckpointType::ErrorRecovery, &guard.state, metadata)
            .await?;

        info!(stage = %stage, attempts, "Workflow cancelled");
        guard.sealed = true;
        Ok(RunOutcome::Cancelled(guard.state.clone()))
    }

    /// Refuse to write once the lease moved to another holder.
    async fn fence(&self, workflow_id: &str, heartbeat: &HeartbeatHandle) -> DomainResult<()> {
        heartbeat.check(workflow_id)?;
        self.locks.verify(&heartbeat.lease()).await?;
        Ok(())
    }

    async fn release(&self, lease: &LockLease) {
        if let Err(e) = self.locks.release(lease).await {
            warn!(
                workflow_id = %lease.workflow_id,
                fencing_token = lease.fencing_token,
                error = %e,
                "Failed to release lease"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryCheckpointStore, InMemoryLeaseStore};
    use crate::domain::models::RetentionPolicy;
    use crate::domain::ports::{StageError, StageFn, StageHandler};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor() -> (PipelineSupervisor, Arc<CheckpointManager>) {
        let checkpoints = Arc::new(
            CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), RetentionPolicy::default())
                .with_prune_on_save(false),
        );
        let locks = Arc::new(LockManager::new(Arc::new(InMemoryLeaseStore::new())));
        let settings = SupervisorSettings {
            retry_policy: RetryPolicy {
                max_attempts: 3,
                fixed_delay: Duration::from_millis(1),
                attempt_timeout: None,
            },
            ..SupervisorSettings::default()
        };
        (
            PipelineSupervisor::new(Arc::clone(&checkpoints), locks, RetryExecutor::default(), settings),
            checkpoints,
        )
    }

    fn echo(stage: Stage) -> Arc<dyn StageHandler> {
        Arc::new(StageFn::new(move |_| async move { Ok(json!({ "stage": stage })) }))
    }

    fn full_registry() -> StageRegistry {
        let mut registry = StageRegistry::new();
        for stage in Stage::PIPELINE {
            registry.register(stage, echo(stage)).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_runs_all_stages_in_order() {
        let (supervisor, checkpoints) = supervisor();
        let outcome = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &full_registry(), CancellationFlag::new())
            .await
            .unwrap();

        assert!(outcome.is_completed());
        let state = outcome.into_state();
        assert_eq!(state.current_stage, Stage::Done);
        for stage in Stage::PIPELINE {
            assert_eq!(state.stage_result(stage), Some(&json!({ "stage": stage })));
        }

        let records = checkpoints.list("wf-1").await.unwrap();
        let completions: Vec<_> = records
            .iter()
            .filter(|r| r.checkpoint_type == CheckpointType::StageCompletion)
            .collect();
        assert_eq!(completions.len(), 5);
        assert_eq!(records.last().unwrap().state_snapshot.current_stage, Stage::Done);
    }

    #[tokio::test]
    async fn test_done_workflow_returns_immediately() {
        let (supervisor, checkpoints) = supervisor();
        let registry = full_registry();
        supervisor
            .run("wf-1", WorkflowInput::new("ai"), &registry, CancellationFlag::new())
            .await
            .unwrap();
        let before = checkpoints.list("wf-1").await.unwrap().len();

        let outcome = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &StageRegistry::new(), CancellationFlag::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(checkpoints.list("wf-1").await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_fatal_error_marks_failed() {
        let (supervisor, checkpoints) = supervisor();
        let mut registry = full_registry();
        registry
            .register(
                Stage::Retrieval,
                Arc::new(StageFn::new(|_| async { Err(StageError::fatal("index missing")) })),
            )
            .unwrap();

        let outcome = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &registry, CancellationFlag::new())
            .await
            .unwrap();

        match outcome {
            RunOutcome::Failed { state, error } => {
                assert_eq!(state.current_stage, Stage::Failed);
                assert_eq!(state.failure.as_ref().unwrap().stage, Stage::Retrieval);
                assert!(matches!(error, DomainError::Fatal { stage: Stage::Retrieval, .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let latest = checkpoints.latest("wf-1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_type, CheckpointType::ErrorRecovery);
        assert_eq!(latest.metadata.get("error"), Some(&json!("index missing")));

        let err = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &registry, CancellationFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::WorkflowFailed { stage: Stage::Retrieval, .. }));
    }

    #[tokio::test]
    async fn test_retryable_error_recovers() {
        let (supervisor, checkpoints) = supervisor();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = full_registry();
        registry
            .register(
                Stage::Synthesis,
                Arc::new(StageFn::new(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 2 {
                            Err(StageError::retryable("rate limited"))
                        } else {
                            Ok(json!("draft"))
                        }
                    }
                })),
            )
            .unwrap();

        let outcome = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &registry, CancellationFlag::new())
            .await
            .unwrap();
        assert!(outcome.is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let synthesis = checkpoints
            .list("wf-1")
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.metadata.get("stage") == Some(&json!("synthesis")))
            .unwrap();
        assert_eq!(synthesis.metadata.get("attempts"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_missing_handler_writes_nothing() {
        let (supervisor, checkpoints) = supervisor();
        let mut registry = StageRegistry::new();
        registry.register(Stage::Research, echo(Stage::Research)).unwrap();

        let err = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &registry, CancellationFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UnsupportedStage(Stage::Extraction)));
        assert!(checkpoints.list("wf-1").await.unwrap().is_empty());

        // lease was released
        supervisor
            .run("wf-1", WorkflowInput::new("ai"), &full_registry(), CancellationFlag::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_keeps_stage() {
        let (supervisor, checkpoints) = supervisor();
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let outcome = supervisor
            .run("wf-1", WorkflowInput::new("ai"), &full_registry(), cancel)
            .await
            .unwrap();
        match outcome {
            RunOutcome::Cancelled(state) => assert_eq!(state.current_stage, Stage::Research),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(checkpoints.latest("wf-1").await.unwrap().unwrap().is_cancellation());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = SupervisorSettings::from_config(&Config::default()).with_instance_id("node-a");
        assert_eq!(settings.instance_id, "node-a");
        assert_eq!(settings.lease_duration, Duration::from_secs(30));
        assert_eq!(settings.renew_interval, Duration::from_secs(10));
        assert_eq!(settings.periodic_interval, Duration::from_secs(60));
        assert_eq!(settings.retry_policy, RetryPolicy::default());
    }
}
