//! Lease store port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::LockLease;

/// One lease row per workflow id, updated only through compare-and-swap.
///
/// Expiry is never evaluated here; the lock manager owns time.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Current row for a workflow, released or not.
    async fn get(&self, workflow_id: &str) -> DomainResult<Option<LockLease>>;

    /// Insert the first row for a workflow. `false` if a row already exists.
    async fn insert_if_absent(&self, lease: &LockLease) -> DomainResult<bool>;

    /// Replace `expected` with `new`. `false` if the stored row no longer
    /// matches `expected` (holder, token, expiry and release flag).
    async fn compare_and_swap(&self, expected: &LockLease, new: &LockLease) -> DomainResult<bool>;

    /// Every stored row.
    async fn list(&self) -> DomainResult<Vec<LockLease>>;
}
