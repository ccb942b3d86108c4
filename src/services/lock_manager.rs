//! Workflow leases with fencing tokens.
//!
//! A lease grants one holder the exclusive right to advance a workflow until
//! it expires. Leases are renewed by their holder, reclaimed by anyone once
//! expired or released, and every change of hands bumps the fencing token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::errors::DomainError;
use crate::domain::models::LockLease;
use crate::domain::ports::LeaseStore;

/// Compare-and-swap rounds before contention is reported as busy.
const DEFAULT_CAS_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Workflow {workflow_id} is locked by {holder_id} until {expires_at}")]
    AlreadyLocked {
        workflow_id: String,
        holder_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lease on workflow {workflow_id} (token {fencing_token}) is no longer held")]
    LeaseExpired { workflow_id: String, fencing_token: u64 },

    #[error(transparent)]
    Store(#[from] DomainError),
}

impl From<LockError> for DomainError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked {
                workflow_id,
                holder_id,
                expires_at,
            } => DomainError::WorkflowBusy {
                workflow_id,
                holder_id,
                expires_at,
            },
            LockError::LeaseExpired {
                workflow_id,
                fencing_token,
            } => DomainError::LeaseExpired {
                workflow_id,
                fencing_token,
            },
            LockError::Store(err) => err,
        }
    }
}

fn lease_span(duration: Duration) -> Result<chrono::Duration, LockError> {
    chrono::Duration::from_std(duration)
        .map_err(|e| LockError::Store(DomainError::ValidationFailed(format!("invalid lease duration: {e}"))))
}

fn still_holds(current: &LockLease, lease: &LockLease) -> bool {
    !current.released && current.fencing_token == lease.fencing_token && current.is_held_by(&lease.holder_id)
}

/// Grants, renews and releases workflow leases over a [`LeaseStore`].
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    max_cas_attempts: u32,
}

impl LockManager {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    /// Take the lease on `workflow_id`.
    ///
    /// A holder asking again for a lease it still holds gets it renewed.
    /// Expired and released leases are taken over with the next fencing token.
    pub async fn acquire(&self, workflow_id: &str, holder_id: &str, duration: Duration) -> Result<LockLease, LockError> {
        let span = lease_span(duration)?;

        for _ in 0..self.max_cas_attempts {
            let now = Utc::now();
            let Some(current) = self.store.get(workflow_id).await? else {
                let lease = LockLease::new(workflow_id, holder_id, 1, now, span);
                if self.store.insert_if_absent(&lease).await? {
                    info!(workflow_id, holder_id, fencing_token = 1, "Lease acquired");
                    return Ok(lease);
                }
                continue;
            };

            if current.is_valid_at(now) && !current.is_held_by(holder_id) {
                return Err(LockError::AlreadyLocked {
                    workflow_id: workflow_id.to_string(),
                    holder_id: current.holder_id,
                    expires_at: current.expires_at,
                });
            }

            let next = if current.is_valid_at(now) {
                current.renewed(now, span)
            } else {
                current.taken_over(holder_id, now, span)
            };
            if self.store.compare_and_swap(&current, &next).await? {
                if next.fencing_token == current.fencing_token {
                    debug!(workflow_id, holder_id, fencing_token = next.fencing_token, "Lease re-acquired by holder");
                } else {
                    info!(
                        workflow_id,
                        holder_id,
                        previous_holder = %current.holder_id,
                        fencing_token = next.fencing_token,
                        "Lease taken over"
                    );
                }
                return Ok(next);
            }
            debug!(workflow_id, holder_id, "Lease swap lost, retrying");
        }

        match self.store.get(workflow_id).await? {
            Some(winner) => Err(LockError::AlreadyLocked {
                workflow_id: workflow_id.to_string(),
                holder_id: winner.holder_id,
                expires_at: winner.expires_at,
            }),
            None => Err(LockError::Store(DomainError::Persistence(format!(
                "lease row for {workflow_id} vanished under contention"
            )))),
        }
    }

    /// Push out the expiry of a lease the caller still holds.
    ///
    /// An expired lease nobody has reclaimed yet can still be renewed.
    pub async fn renew(&self, lease: &LockLease, duration: Duration) -> Result<LockLease, LockError> {
        let span = lease_span(duration)?;
        let lost = || LockError::LeaseExpired {
            workflow_id: lease.workflow_id.clone(),
            fencing_token: lease.fencing_token,
        };

        let current = self.store.get(&lease.workflow_id).await?.ok_or_else(lost)?;
        if !still_holds(&current, lease) {
            return Err(lost());
        }

        let next = current.renewed(Utc::now(), span);
        if self.store.compare_and_swap(&current, &next).await? {
            Ok(next)
        } else {
            Err(lost())
        }
    }

    /// Confirm the caller's grant is still the stored one before it writes.
    ///
    /// Fails with [`LockError::LeaseExpired`] once the lease was released or
    /// reclaimed under a newer fencing token. An expired grant nobody has
    /// reclaimed still passes, as it does for [`renew`](Self::renew).
    pub async fn verify(&self, lease: &LockLease) -> Result<LockLease, LockError> {
        match self.store.get(&lease.workflow_id).await? {
            Some(current) if still_holds(&current, lease) => Ok(current),
            stored => {
                warn!(
                    workflow_id = %lease.workflow_id,
                    fencing_token = lease.fencing_token,
                    current_token = stored.as_ref().map(|c| c.fencing_token),
                    "Fencing check failed"
                );
                Err(LockError::LeaseExpired {
                    workflow_id: lease.workflow_id.clone(),
                    fencing_token: lease.fencing_token,
                })
            }
        }
    }

    /// Give the lease back. Stale, reclaimed and already released leases are ignored.
    pub async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let Some(current) = self.store.get(&lease.workflow_id).await? else {
            return Ok(());
        };
        if !still_holds(&current, lease) {
            debug!(
                workflow_id = %lease.workflow_id,
                fencing_token = lease.fencing_token,
                "Release of stale lease ignored"
            );
            return Ok(());
        }

        if self.store.compare_and_swap(&current, &current.as_released()).await? {
            info!(
                workflow_id = %lease.workflow_id,
                holder_id = %lease.holder_id,
                fencing_token = lease.fencing_token,
                "Lease released"
            );
        }
        Ok(())
    }

    /// The stored lease row, whether or not it is still valid.
    pub async fn current(&self, workflow_id: &str) -> Result<Option<LockLease>, LockError> {
        Ok(self.store.get(workflow_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<LockLease>, LockError> {
        Ok(self.store.list().await?)
    }

    /// Operator override: mark the stored lease released whoever holds it.
    ///
    /// Returns `false` when there was nothing to release.
    pub async fn force_release(&self, workflow_id: &str) -> Result<bool, LockError> {
        let Some(current) = self.store.get(workflow_id).await? else {
            return Ok(false);
        };
        if current.released {
            return Ok(false);
        }

        let released = self.store.compare_and_swap(&current, &current.as_released()).await?;
        if released {
            warn!(
                workflow_id,
                holder_id = %current.holder_id,
                fencing_token = current.fencing_token,
                "Lease force-released"
            );
        }
        Ok(released)
    }
}
