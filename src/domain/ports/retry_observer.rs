//! Retry observer port.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::models::Stage;

/// What the retry executor knows about a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryContext {
    pub workflow_id: String,
    pub stage: Stage,
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub last_error: String,
    /// Whether another attempt follows after the delay.
    pub will_retry: bool,
    /// When the failed attempt would have timed out, if it had a deadline.
    pub deadline: Option<DateTime<Utc>>,
}

/// Notified synchronously after every failed attempt, before the delay.
pub trait RetryObserver: Send + Sync {
    fn on_attempt_failed(&self, context: &RetryContext);
}
