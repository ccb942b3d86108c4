//! Workflow state machine types.
//!
//! A [`WorkflowState`] is the authoritative progress record for one unit of
//! work. It moves through the fixed pipeline one stage at a time:
//!
//! ```text
//! Research → Extraction → Retrieval → Synthesis → Visualization → Done
//!     ↘           ↘            ↘            ↘             ↘
//!                              Failed
//! ```
//!
//! Stage payloads are opaque JSON owned by the stage handlers. A stage counts
//! as completed exactly when its payload is present in `results`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

/// One step of the pipeline, plus the two terminal states.
///
/// Variant order is the enumeration order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Document collection.
    Research,
    /// Entity and relation extraction.
    Extraction,
    /// Similarity retrieval.
    Retrieval,
    /// Document synthesis.
    Synthesis,
    /// Visualization preparation.
    Visualization,
    /// All stages completed.
    Done,
    /// Absorbing failure state.
    Failed,
}

impl Stage {
    /// The executable stages, in order.
    pub const PIPELINE: [Self; 5] = [
        Self::Research,
        Self::Extraction,
        Self::Retrieval,
        Self::Synthesis,
        Self::Visualization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Extraction => "extraction",
            Self::Retrieval => "retrieval",
            Self::Synthesis => "synthesis",
            Self::Visualization => "visualization",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether this is `Done` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether a handler runs for this stage.
    pub fn is_executable(&self) -> bool {
        !self.is_terminal()
    }

    /// The stage that follows a successful run of `self`.
    ///
    /// Terminal stages have no successor.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Research => Some(Self::Extraction),
            Self::Extraction => Some(Self::Retrieval),
            Self::Retrieval => Some(Self::Synthesis),
            Self::Synthesis => Some(Self::Visualization),
            Self::Visualization => Some(Self::Done),
            Self::Done | Self::Failed => None,
        }
    }

    /// Executable stages from `self` (inclusive) to the end of the pipeline.
    pub fn remaining(&self) -> Vec<Self> {
        Self::PIPELINE.iter().copied().filter(|s| s >= self).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(Self::Research),
            "extraction" => Ok(Self::Extraction),
            "retrieval" => Ok(Self::Retrieval),
            "synthesis" => Ok(Self::Synthesis),
            "visualization" => Ok(Self::Visualization),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::SerializationError(format!(
                "Unknown stage: {other}"
            ))),
        }
    }
}

/// The immutable input that triggered a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowInput {
    /// Search keyword driving the research stage.
    pub keyword: String,
    /// Additional caller-supplied parameters, passed through to handlers.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl WorkflowInput {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Why a workflow ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage whose handler failed.
    pub stage: Stage,
    /// Last observed error message.
    pub error: String,
    /// Handler invocations spent on the stage.
    pub attempts: u32,
}

/// Progress record for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    /// Correlation id for logs and traces; independent of `workflow_id`.
    pub trace_id: Uuid,
    pub current_stage: Stage,
    pub input: WorkflowInput,
    /// Completed stages and their payloads.
    #[serde(default)]
    pub results: BTreeMap<Stage, serde_json::Value>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// A fresh workflow positioned at the first stage.
    pub fn new(workflow_id: impl Into<String>, input: WorkflowInput) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            trace_id: Uuid::new_v4(),
            current_stage: Stage::Research,
            input,
            results: BTreeMap::new(),
            failure: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_stage.is_terminal()
    }

    pub fn is_stage_completed(&self, stage: Stage) -> bool {
        self.results.contains_key(&stage)
    }

    pub fn stage_result(&self, stage: Stage) -> Option<&serde_json::Value> {
        self.results.get(&stage)
    }

    /// Stages still to execute, in order. Empty for terminal states.
    pub fn remaining_stages(&self) -> Vec<Stage> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.current_stage
            .remaining()
            .into_iter()
            .filter(|stage| !self.is_stage_completed(*stage))
            .collect()
    }

    /// Record the payload of the current stage and advance one step.
    pub fn complete_stage(&mut self, stage: Stage, payload: serde_json::Value) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: self.current_stage.to_string(),
                to: stage.to_string(),
                reason: "workflow is already terminal".to_string(),
            });
        }
        if stage != self.current_stage {
            return Err(DomainError::InvalidStateTransition {
                from: self.current_stage.to_string(),
                to: stage.to_string(),
                reason: "only the current stage can complete".to_string(),
            });
        }
        let Some(next) = stage.next() else {
            return Err(DomainError::InvalidStateTransition {
                from: stage.to_string(),
                to: stage.to_string(),
                reason: "stage has no successor".to_string(),
            });
        };

        let now = Utc::now();
        self.results.insert(stage, payload);
        self.current_stage = next;
        self.updated_at = now;
        if next == Stage::Done {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Move to the absorbing `Failed` state.
    pub fn mark_failed(&mut self, failure: StageFailure) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::InvalidStateTransition {
                from: self.current_stage.to_string(),
                to: Stage::Failed.to_string(),
                reason: "workflow is already terminal".to_string(),
            });
        }
        self.current_stage = Stage::Failed;
        self.failure = Some(failure);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// A copy of this snapshot to continue from, as produced by a rollback.
    ///
    /// Only `updated_at` differs from the snapshot.
    pub fn restored(&self) -> Self {
        Self {
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> WorkflowState {
        WorkflowState::new("wf-1", WorkflowInput::new("ai"))
    }

    #[test]
    fn test_stage_order_and_successors() {
        let mut stage = Stage::Research;
        let mut visited = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage, "{next} should follow {stage}");
            visited.push(next);
            stage = next;
        }
        assert_eq!(
            visited,
            vec![
                Stage::Research,
                Stage::Extraction,
                Stage::Retrieval,
                Stage::Synthesis,
                Stage::Visualization,
                Stage::Done,
            ]
        );
        assert_eq!(Stage::Failed.next(), None);
    }

    #[test]
    fn test_stage_string_roundtrip() {
        for stage in Stage::PIPELINE.iter().chain([Stage::Done, Stage::Failed].iter()) {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), *stage);
            let json = serde_json::to_string(stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
        }
        assert!("wiki".parse::<Stage>().is_err());
    }

    #[test]
    fn test_new_state_starts_at_research() {
        let state = state();
        assert_eq!(state.current_stage, Stage::Research);
        assert!(state.results.is_empty());
        assert_eq!(state.remaining_stages(), Stage::PIPELINE.to_vec());
        assert_eq!(state.created_at, state.updated_at);
    }

    #[test]
    fn test_complete_stage_advances_one_step() {
        let mut state = state();
        state.complete_stage(Stage::Research, json!({"documents": 3})).unwrap();

        assert_eq!(state.current_stage, Stage::Extraction);
        assert!(state.is_stage_completed(Stage::Research));
        assert_eq!(state.stage_result(Stage::Research), Some(&json!({"documents": 3})));
        assert!(!state.is_stage_completed(Stage::Extraction));
        assert_eq!(state.stage_result(Stage::Extraction), None);
    }

    #[test]
    fn test_complete_stage_rejects_skipping() {
        let mut state = state();
        let err = state.complete_stage(Stage::Retrieval, json!(null)).unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(state.current_stage, Stage::Research);
        assert!(state.results.is_empty());
    }

    #[test]
    fn test_full_pipeline_reaches_done() {
        let mut state = state();
        for stage in Stage::PIPELINE {
            state.complete_stage(stage, json!(stage.as_str())).unwrap();
        }
        assert_eq!(state.current_stage, Stage::Done);
        assert!(state.completed_at.is_some());
        assert!(state.remaining_stages().is_empty());
        assert!(state.complete_stage(Stage::Done, json!(null)).is_err());
    }

    #[test]
    fn test_mark_failed_is_absorbing() {
        let mut state = state();
        state
            .mark_failed(StageFailure {
                stage: Stage::Research,
                error: "boom".to_string(),
                attempts: 1,
            })
            .unwrap();

        assert_eq!(state.current_stage, Stage::Failed);
        assert!(state.remaining_stages().is_empty());
        assert!(state.complete_stage(Stage::Research, json!(null)).is_err());
        assert!(state
            .mark_failed(StageFailure {
                stage: Stage::Research,
                error: "again".to_string(),
                attempts: 1,
            })
            .is_err());
    }

    #[test]
    fn test_restored_only_touches_updated_at() {
        let mut state = state();
        state.complete_stage(Stage::Research, json!([1, 2])).unwrap();
        let restored = state.restored();

        assert!(restored.updated_at >= state.updated_at);
        assert_eq!(
            WorkflowState {
                updated_at: state.updated_at,
                ..restored
            },
            state
        );
    }

    #[test]
    fn test_workflow_state_serde_roundtrip() {
        let mut state = state();
        state.input = state.input.clone().with_parameter("depth", json!(2));
        state.complete_stage(Stage::Research, json!({"urls": ["a", "b"]})).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let deserialized: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, deserialized);
    }
}
