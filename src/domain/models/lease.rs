//! Workflow lease with fencing token.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive, time-bounded right to advance one workflow.
///
/// The `fencing_token` increases every time the lease changes hands, so a
/// holder that outlived its lease can detect that it was replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub workflow_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub fencing_token: u64,
    /// Set by an explicit release. The row is kept so the token stays monotonic.
    #[serde(default)]
    pub released: bool,
}

impl LockLease {
    pub fn new(
        workflow_id: impl Into<String>,
        holder_id: impl Into<String>,
        fencing_token: u64,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            holder_id: holder_id.into(),
            acquired_at: now,
            expires_at: now + duration,
            fencing_token,
            released: false,
        }
    }

    /// Held and not yet expired at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.released && now < self.expires_at
    }

    pub fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }

    /// The same grant with a pushed-out expiry.
    pub fn renewed(&self, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            expires_at: now + duration,
            ..self.clone()
        }
    }

    /// Successor lease for a new holder after expiry or release.
    pub fn taken_over(&self, holder_id: impl Into<String>, now: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(
            self.workflow_id.clone(),
            holder_id,
            self.fencing_token.saturating_add(1),
            now,
            duration,
        )
    }

    pub fn as_released(&self) -> Self {
        Self {
            released: true,
            ..self.clone()
        }
    }

    /// Time left before expiry, zero once expired or released.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        if self.is_valid_at(now) {
            self.expires_at - now
        } else {
            Duration::zero()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let lease = LockLease::new("wf-1", "a", 1, now, Duration::seconds(30));
        assert!(lease.is_valid_at(now));
        assert!(lease.is_valid_at(now + Duration::seconds(29)));
        assert!(!lease.is_valid_at(now + Duration::seconds(30)));
        assert!(!lease.as_released().is_valid_at(now));
    }

    #[test]
    fn test_taken_over_increments_token() {
        let now = Utc::now();
        let lease = LockLease::new("wf-1", "a", 7, now, Duration::seconds(1));
        let next = lease.taken_over("b", now + Duration::seconds(2), Duration::seconds(30));
        assert_eq!(next.fencing_token, 8);
        assert_eq!(next.holder_id, "b");
        assert!(!next.released);
    }

    #[test]
    fn test_renewed_keeps_token() {
        let now = Utc::now();
        let lease = LockLease::new("wf-1", "a", 3, now, Duration::seconds(1));
        let renewed = lease.renewed(now, Duration::seconds(60));
        assert_eq!(renewed.fencing_token, 3);
        assert_eq!(renewed.acquired_at, lease.acquired_at);
        assert_eq!(renewed.remaining_at(now), Duration::seconds(60));
    }
}
