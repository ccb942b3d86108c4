//! Stage handler registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Stage;
use crate::domain::ports::StageHandler;

/// A handler plus the attempt deadline it asks for, if any.
#[derive(Clone)]
pub struct RegisteredStage {
    pub handler: Arc<dyn StageHandler>,
    /// Overrides the retry policy's attempt timeout for this stage.
    pub timeout: Option<Duration>,
}

/// Maps executable stages to their handlers.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: BTreeMap<Stage, RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> DomainResult<()> {
        self.insert(stage, handler, None)
    }

    pub fn register_with_timeout(
        &mut self,
        stage: Stage,
        handler: Arc<dyn StageHandler>,
        timeout: Duration,
    ) -> DomainResult<()> {
        self.insert(stage, handler, Some(timeout))
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> DomainResult<Self> {
        self.register(stage, handler)?;
        Ok(self)
    }

    fn insert(&mut self, stage: Stage, handler: Arc<dyn StageHandler>, timeout: Option<Duration>) -> DomainResult<()> {
        if !stage.is_executable() {
            return Err(DomainError::ValidationFailed(format!(
                "stage {stage} is terminal and cannot have a handler"
            )));
        }
        self.stages.insert(stage, RegisteredStage { handler, timeout });
        Ok(())
    }

    pub fn get(&self, stage: Stage) -> Option<&RegisteredStage> {
        self.stages.get(&stage)
    }

    /// Registered stages in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.keys().copied().collect()
    }

    /// Stages of `wanted` with no handler, in the order given.
    pub fn missing(&self, wanted: &[Stage]) -> Vec<Stage> {
        wanted.iter().copied().filter(|s| !self.stages.contains_key(s)).collect()
    }

    /// Whether every pipeline stage has a handler.
    pub fn is_complete(&self) -> bool {
        self.missing(&Stage::PIPELINE).is_empty()
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry").field("stages", &self.stages()).finish()
    }
}
