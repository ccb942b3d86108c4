//! Fixed-delay retry of a single stage invocation.
//!
//! Each failed attempt is classified by its [`StageError`]: fatal errors stop
//! immediately, retryable ones wait a constant delay and try again until
//! `max_attempts` invocations have been spent. An attempt that outlives its
//! deadline counts as retryable.
//!
//! The executor never logs. Every failed attempt is reported to a
//! [`RetryObserver`], which decides what to do with it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Constant;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};

use crate::domain::models::{RetryConfig, Stage};
use crate::domain::ports::{RetryContext, RetryObserver, StageError};

/// Retry policy for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations, first attempt included.
    pub max_attempts: u32,
    /// Constant pause between attempts.
    pub fixed_delay: Duration,
    /// Per-attempt deadline.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            fixed_delay: Duration::from_secs(1),
            attempt_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            fixed_delay: Duration::from_millis(config.fixed_delay_ms),
            attempt_timeout: (config.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(config.attempt_timeout_ms)),
        }
    }
}

impl RetryPolicy {
    /// Replace the attempt deadline when a handler brings its own.
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        if timeout.is_some() {
            self.attempt_timeout = timeout;
        }
        self
    }

    fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Cooperative cancellation signal shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles signal the same run.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Which workflow and stage an execution belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryScope {
    pub workflow_id: String,
    pub stage: Stage,
}

impl RetryScope {
    pub fn new(workflow_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            stage,
        }
    }
}

/// A successful value and the invocations it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("fatal error after {attempts} attempt(s): {error}")]
    Fatal { attempts: u32, error: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempts, .. } | Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Error type threaded through `backoff`: keep going, or stop with a verdict.
enum Attempt {
    Retry(StageError),
    Stop(RetryError),
}

/// Logs failed attempts through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRetryObserver;

impl RetryObserver for TracingRetryObserver {
    fn on_attempt_failed(&self, context: &RetryContext) {
        if context.will_retry {
            warn!(
                workflow_id = %context.workflow_id,
                stage = %context.stage,
                attempt = context.attempt,
                max_attempts = context.max_attempts,
                error = %context.last_error,
                "Stage attempt failed, retrying"
            );
        } else {
            error!(
                workflow_id = %context.workflow_id,
                stage = %context.stage,
                attempt = context.attempt,
                max_attempts = context.max_attempts,
                error = %context.last_error,
                "Stage attempt failed, giving up"
            );
        }
    }
}

/// Runs stage operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    observer: Arc<dyn RetryObserver>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(Arc::new(TracingRetryObserver))
    }
}

impl RetryExecutor {
    pub fn new(observer: Arc<dyn RetryObserver>) -> Self {
        Self { observer }
    }

    /// Invoke `operation` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` is raised between attempts.
    pub async fn execute<T, F, Fut>(
        &self,
        scope: &RetryScope,
        policy: &RetryPolicy,
        cancel: &CancellationFlag,
        mut operation: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let max_attempts = policy.effective_max_attempts();
        let attempts = AtomicU32::new(0);
        let observer = &self.observer;
        let attempts_ref = &attempts;

        let result = backoff::future::retry(Constant::new(policy.fixed_delay), || {
            let attempt = attempts_ref.fetch_add(1, Ordering::SeqCst) + 1;
            let cancelled_before = attempt > 1 && cancel.is_cancelled();
            let deadline = policy
                .attempt_timeout
                .and_then(|t| chrono::Duration::from_std(t).ok())
                .map(|t| Utc::now() + t);
            let call = (!cancelled_before).then(|| operation());

            async move {
                let Some(call) = call else {
                    return Err(backoff::Error::permanent(Attempt::Stop(RetryError::Cancelled {
                        attempts: attempt - 1,
                    })));
                };

                let outcome = match policy.attempt_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
                        Err(StageError::retryable(format!("attempt timed out after {timeout:?}")))
                    }),
                    None => call.await,
                };

                let err = match outcome {
                    Ok(value) => return Ok(Attempted { value, attempts: attempt }),
                    Err(err) => err,
                };

                let will_retry = err.is_retryable() && attempt < max_attempts && !cancel.is_cancelled();
                observer.on_attempt_failed(&RetryContext {
                    workflow_id: scope.workflow_id.clone(),
                    stage: scope.stage,
                    attempt,
                    max_attempts,
                    last_error: err.message().to_string(),
                    will_retry,
                    deadline,
                });

                match err {
                    StageError::Fatal(error) => Err(backoff::Error::permanent(Attempt::Stop(RetryError::Fatal {
                        attempts: attempt,
                        error,
                    }))),
                    StageError::Retryable(last_error) if attempt >= max_attempts => {
                        Err(backoff::Error::permanent(Attempt::Stop(RetryError::Exhausted {
                            attempts: attempt,
                            last_error,
                        })))
                    }
                    StageError::Retryable(_) if cancel.is_cancelled() => {
                        Err(backoff::Error::permanent(Attempt::Stop(RetryError::Cancelled { attempts: attempt })))
                    }
                    retryable => Err(backoff::Error::transient(Attempt::Retry(retryable))),
                }
            }
        })
        .await;

        result.map_err(|failure| match failure {
            Attempt::Stop(err) => err,
            // A constant backoff never gives up on its own.
            Attempt::Retry(err) => RetryError::Exhausted {
                attempts: attempts.load(Ordering::SeqCst),
                last_error: err.message().to_string(),
            },
        })
    }
}
