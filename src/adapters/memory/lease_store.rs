//! In-memory LeaseStore.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::models::LockLease;
use crate::domain::ports::LeaseStore;

/// Process-local lease table. Swaps are atomic under a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LockLease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn get(&self, workflow_id: &str) -> DomainResult<Option<LockLease>> {
        Ok(self.leases.lock().await.get(workflow_id).cloned())
    }

    async fn insert_if_absent(&self, lease: &LockLease) -> DomainResult<bool> {
        let mut leases = self.leases.lock().await;
        if leases.contains_key(&lease.workflow_id) {
            return Ok(false);
        }
        leases.insert(lease.workflow_id.clone(), lease.clone());
        Ok(true)
    }

    async fn compare_and_swap(&self, expected: &LockLease, new: &LockLease) -> DomainResult<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&expected.workflow_id) {
            Some(current) if current == expected => {
                *current = new.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self) -> DomainResult<Vec<LockLease>> {
        let mut leases: Vec<_> = self.leases.lock().await.values().cloned().collect();
        leases.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        Ok(leases)
    }
}
