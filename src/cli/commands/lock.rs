//! Lease inspection commands.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;

use crate::cli::output::{list_table, output, render_list, CommandOutput};
use crate::domain::models::LockLease;
use crate::services::WorkflowService;

#[derive(Debug, Serialize)]
struct LeaseView {
    #[serde(flatten)]
    lease: LockLease,
    active: bool,
}

#[derive(Debug, Serialize)]
struct LockListOutput {
    leases: Vec<LeaseView>,
}

impl CommandOutput for LockListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["workflow", "holder", "token", "expires", "state"]);
        for view in &self.leases {
            let state = if view.lease.released {
                "released"
            } else if view.active {
                "held"
            } else {
                "expired"
            };
            table.add_row(vec![
                view.lease.workflow_id.clone(),
                view.lease.holder_id.clone(),
                view.lease.fencing_token.to_string(),
                view.lease.expires_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                state.to_string(),
            ]);
        }
        render_list("lease", &table, self.leases.len())
    }
}

#[derive(Debug, Serialize)]
struct UnlockOutput {
    workflow_id: String,
    released: bool,
}

impl CommandOutput for UnlockOutput {
    fn to_human(&self) -> String {
        if self.released {
            format!("Lease on {} released", self.workflow_id)
        } else {
            format!("No active lease on {}", self.workflow_id)
        }
    }
}

pub async fn list(service: &WorkflowService, json_mode: bool) -> Result<()> {
    let now = Utc::now();
    let leases = service
        .locks()
        .await?
        .into_iter()
        .map(|lease| LeaseView {
            active: lease.is_valid_at(now),
            lease,
        })
        .collect();
    output(&LockListOutput { leases }, json_mode);
    Ok(())
}

pub async fn unlock(service: &WorkflowService, workflow_id: &str, json_mode: bool) -> Result<()> {
    let released = service.unlock(workflow_id).await?;
    output(
        &UnlockOutput {
            workflow_id: workflow_id.to_string(),
            released,
        },
        json_mode,
    );
    Ok(())
}
