//! Store health check.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::cli::output::{output, CommandOutput};
use crate::services::{HealthReport, WorkflowService};

#[derive(Debug, Serialize)]
struct HealthOutput {
    #[serde(flatten)]
    report: HealthReport,
}

impl CommandOutput for HealthOutput {
    fn to_human(&self) -> String {
        let status = if self.report.healthy { "healthy" } else { "unhealthy" };
        format!(
            "Status: {status}\nStore reachable: {}\nActive runs: {}",
            if self.report.store_reachable { "yes" } else { "no" },
            self.report.active_runs
        )
    }
}

pub async fn execute(service: &WorkflowService, json_mode: bool) -> Result<()> {
    let report = service.health().await;
    let healthy = report.healthy;
    output(&HealthOutput { report }, json_mode);
    if !healthy {
        bail!("Workflow store is unreachable");
    }
    Ok(())
}
