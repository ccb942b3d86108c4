//! Service layer: the workflow orchestration core.

pub mod checkpoint_manager;
pub mod heartbeat;
pub mod lock_manager;
pub mod pipeline_supervisor;
pub mod retry_executor;
pub mod stage_registry;
pub mod workflow_service;

pub use checkpoint_manager::{select_prunable, CheckpointManager};
pub use lock_manager::{LockError, LockManager};
pub use pipeline_supervisor::{PipelineSupervisor, RunOutcome, SupervisorSettings};
pub use retry_executor::{
    Attempted, CancellationFlag, RetryError, RetryExecutor, RetryPolicy, RetryScope, TracingRetryObserver,
};
pub use stage_registry::{RegisteredStage, StageRegistry};
pub use workflow_service::{HealthReport, WorkflowService};
