//! Stage handler port.
//!
//! Every executable [`Stage`](crate::domain::models::Stage) is backed by one
//! handler. Handlers are opaque to the orchestrator: they read the workflow
//! state and return a JSON payload, or a classified error.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::models::WorkflowState;

/// Classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// Worth another attempt (timeouts, rate limits, flaky upstreams).
    #[error("retryable: {0}")]
    Retryable(String),

    /// Retrying will not help.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The message without its classification prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(message) | Self::Fatal(message) => message,
        }
    }
}

/// Work performed for one stage.
///
/// Handlers must not mutate the state they receive; the supervisor records
/// the returned payload itself.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn execute(&self, state: &WorkflowState) -> Result<serde_json::Value, StageError>;
}

type BoxedStageFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, StageError>> + Send>>;

/// Adapts an async closure into a [`StageHandler`].
///
/// The closure receives an owned copy of the state so the returned future can
/// be `'static`.
pub struct StageFn {
    inner: Arc<dyn Fn(WorkflowState) -> BoxedStageFuture + Send + Sync>,
}

impl StageFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, StageError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move |state| Box::pin(f(state))),
        }
    }
}

impl std::fmt::Debug for StageFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl StageHandler for StageFn {
    async fn execute(&self, state: &WorkflowState) -> Result<serde_json::Value, StageError> {
        (self.inner)(state.clone()).await
    }
}
