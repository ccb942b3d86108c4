//! Domain errors for the kgflow orchestration core.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::models::workflow_state::Stage;

/// Domain-level errors that can occur while orchestrating workflows.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Another execution holds the workflow lease. Not a failure.
    #[error("Workflow {workflow_id} is busy: held by {holder_id} until {expires_at}")]
    WorkflowBusy {
        workflow_id: String,
        holder_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("No handler registered for stage {0}")]
    UnsupportedStage(Stage),

    #[error("Stage {stage} failed fatally: {message}")]
    Fatal { stage: Stage, message: String },

    #[error("Stage {stage} failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Checkpoint {checkpoint_id} not found for workflow {workflow_id}")]
    CheckpointNotFound {
        workflow_id: String,
        checkpoint_id: String,
    },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Workflow {workflow_id} failed at stage {stage}; roll back to a checkpoint before resuming")]
    WorkflowFailed { workflow_id: String, stage: Stage },

    #[error("Lease on workflow {workflow_id} lost (fencing token {fencing_token})")]
    LeaseExpired {
        workflow_id: String,
        fencing_token: u64,
    },

    #[error("Workflow {workflow_id} cancelled before stage {stage}")]
    Cancelled { workflow_id: String, stage: Stage },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Lock contention rather than a failure of the workflow itself.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::WorkflowBusy { .. })
    }

    /// The store could not be read or written.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::SerializationError(_))
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
