//! Checkpoint records and retention policy.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workflow_state::WorkflowState;
use crate::domain::errors::DomainError;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Written on a fixed interval while a run is in flight.
    Periodic,
    /// Written after a stage completed successfully.
    StageCompletion,
    /// Operator-requested snapshot, or the result of a rollback.
    Manual,
    /// Written before abandoning a stage (failure or cancellation).
    ErrorRecovery,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::StageCompletion => "stage_completion",
            Self::Manual => "manual",
            Self::ErrorRecovery => "error_recovery",
        }
    }
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "periodic" => Ok(Self::Periodic),
            "stage_completion" => Ok(Self::StageCompletion),
            "manual" => Ok(Self::Manual),
            "error_recovery" => Ok(Self::ErrorRecovery),
            other => Err(DomainError::SerializationError(format!(
                "Unknown checkpoint type: {other}"
            ))),
        }
    }
}

/// Free-form checkpoint metadata.
pub type CheckpointMetadata = BTreeMap<String, serde_json::Value>;

/// Immutable, timestamped copy of a [`WorkflowState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Time-ordered (UUID v7) identifier.
    pub checkpoint_id: Uuid,
    pub workflow_id: String,
    pub checkpoint_type: CheckpointType,
    pub state_snapshot: WorkflowState,
    #[serde(default)]
    pub metadata: CheckpointMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CheckpointRecord {
    pub fn new(
        checkpoint_type: CheckpointType,
        state_snapshot: WorkflowState,
        metadata: CheckpointMetadata,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::now_v7(),
            workflow_id: state_snapshot.workflow_id.clone(),
            checkpoint_type,
            state_snapshot,
            metadata,
            created_at,
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Same type, snapshot and metadata; ids and timestamps are ignored.
    pub fn same_content(&self, other: &Self) -> bool {
        self.workflow_id == other.workflow_id
            && self.checkpoint_type == other.checkpoint_type
            && self.state_snapshot == other.state_snapshot
            && self.metadata == other.metadata
    }

    /// Whether this record was written for a cancelled run.
    pub fn is_cancellation(&self) -> bool {
        self.checkpoint_type == CheckpointType::ErrorRecovery
            && self.metadata.get("cancelled") == Some(&serde_json::Value::Bool(true))
    }
}

/// Which checkpoints may be pruned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Records older than this are eligible. `None` disables the age limit.
    pub max_age: Option<Duration>,
    /// Records beyond this count (oldest first) are eligible.
    pub max_per_workflow: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
            max_per_workflow: 10,
        }
    }
}

/// Outcome of a prune pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub workflows_scanned: usize,
    pub deleted: usize,
}

impl PruneReport {
    pub fn merge(&mut self, other: &Self) {
        self.workflows_scanned += other.workflows_scanned;
        self.deleted += other.deleted;
    }
}
