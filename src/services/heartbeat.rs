//! Per-run heartbeat: lease renewal and periodic checkpoints.
//!
//! One heartbeat task accompanies every in-flight run. It never cancels a
//! write halfway: shutdown is only observed between ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{CheckpointMetadata, CheckpointType, LockLease, WorkflowState};
use crate::services::checkpoint_manager::CheckpointManager;
use crate::services::lock_manager::{LockError, LockManager};

/// Timing of a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub periodic_interval: Duration,
}

/// The committed state of a run, shared by the run and its heartbeat.
///
/// Every checkpoint write of a run happens while this is locked, which keeps
/// the run's writes in order. The heartbeat only ever `try_lock`s it, so lease
/// renewal never waits behind a slow write.
#[derive(Debug)]
pub struct RunLedger {
    pub state: WorkflowState,
    /// Set once the run wrote its final checkpoint; no periodic write may follow.
    pub sealed: bool,
}

impl RunLedger {
    pub fn new(state: WorkflowState) -> Self {
        Self { state, sealed: false }
    }
}

/// Why a heartbeat gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatFault {
    LeaseLost { fencing_token: u64 },
    Persistence(String),
}

impl HeartbeatFault {
    pub fn into_error(self, workflow_id: &str) -> DomainError {
        match self {
            Self::LeaseLost { fencing_token } => DomainError::LeaseExpired {
                workflow_id: workflow_id.to_string(),
                fencing_token,
            },
            Self::Persistence(message) => DomainError::Persistence(message),
        }
    }
}

/// Handle held by the run that owns the heartbeat.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    lease: watch::Receiver<LockLease>,
    fault: watch::Receiver<Option<HeartbeatFault>>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// `Err` once the heartbeat has reported a fault.
    pub fn check(&self, workflow_id: &str) -> DomainResult<()> {
        match self.fault.borrow().clone() {
            Some(fault) => Err(fault.into_error(workflow_id)),
            None => Ok(()),
        }
    }

    /// The lease as of the last successful renewal.
    pub fn lease(&self) -> LockLease {
        self.lease.borrow().clone()
    }

    /// Stop the heartbeat and return the latest lease.
    pub async fn stop(self) -> LockLease {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Heartbeat task ended abnormally");
        }
        self.lease.borrow().clone()
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let period = period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Start the heartbeat for a run holding `lease`.
pub fn spawn_heartbeat(
    lease: LockLease,
    ledger: Arc<Mutex<RunLedger>>,
    locks: Arc<LockManager>,
    checkpoints: Arc<CheckpointManager>,
    config: HeartbeatConfig,
) -> HeartbeatHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (lease_tx, lease_rx) = watch::channel(lease.clone());
    let (fault_tx, fault_rx) = watch::channel(None);

    let task = tokio::spawn(async move {
        let mut lease = lease;
        let mut renew = ticker(config.renew_interval);
        let mut periodic = ticker(config.periodic_interval);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = renew.tick() => match locks.renew(&lease, config.lease_duration).await {
                    Ok(renewed) => {
                        debug!(
                            workflow_id = %renewed.workflow_id,
                            fencing_token = renewed.fencing_token,
                            expires_at = %renewed.expires_at,
                            "Lease renewed"
                        );
                        lease = renewed;
                        let _ = lease_tx.send(lease.clone());
                    }
                    Err(LockError::Store(e)) => {
                        warn!(workflow_id = %lease.workflow_id, error = %e, "Lease renewal failed, will retry");
                    }
                    Err(e) => {
                        warn!(workflow_id = %lease.workflow_id, error = %e, "Lease lost");
                        let _ = fault_tx.send(Some(HeartbeatFault::LeaseLost {
                            fencing_token: lease.fencing_token,
                        }));
                        break;
                    }
                },

                _ = periodic.tick() => {
                    // a run holding the ledger is writing a fresher checkpoint itself
                    let Ok(guard) = ledger.try_lock() else {
                        debug!(workflow_id = %lease.workflow_id, "Ledger busy, periodic checkpoint skipped");
                        continue;
                    };
                    if guard.sealed {
                        continue;
                    }
                    match locks.verify(&lease).await {
                        Ok(_) => {}
                        Err(LockError::Store(e)) => {
                            warn!(workflow_id = %lease.workflow_id, error = %e, "Fencing check failed, periodic checkpoint skipped");
                            continue;
                        }
                        Err(e) => {
                            warn!(workflow_id = %lease.workflow_id, error = %e, "Lease lost");
                            let _ = fault_tx.send(Some(HeartbeatFault::LeaseLost {
                                fencing_token: lease.fencing_token,
                            }));
                            break;
                        }
                    }
                    let metadata = CheckpointMetadata::from([(
                        "stage".to_string(),
                        serde_json::Value::from(guard.state.current_stage.as_str()),
                    )]);
                    let saved = checkpoints
                        .save(&guard.state.workflow_id, CheckpointType::Periodic, &guard.state, metadata)
                        .await;
                    if let Err(e) = saved {
                        warn!(workflow_id = %guard.state.workflow_id, error = %e, "Periodic checkpoint failed");
                        let _ = fault_tx.send(Some(HeartbeatFault::Persistence(e.to_string())));
                        break;
                    }
                }
            }
        }
    });

    HeartbeatHandle {
        shutdown: shutdown_tx,
        lease: lease_rx,
        fault: fault_rx,
        task,
    }
}
