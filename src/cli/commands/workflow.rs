//! Workflow inspection and repair commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::cli::output::{list_table, output, render_list, truncate, CommandOutput};
use crate::domain::models::{CheckpointRecord, PruneReport, Stage, WorkflowState};
use crate::services::WorkflowService;

#[derive(Debug, Serialize)]
struct StatusOutput {
    #[serde(flatten)]
    state: WorkflowState,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        let state = &self.state;
        let mut lines = vec![
            format!("Workflow: {}", state.workflow_id),
            format!("Stage:    {}", state.current_stage),
            format!("Keyword:  {}", state.input.keyword),
            format!("Trace:    {}", state.trace_id),
            format!("Updated:  {}", state.updated_at.to_rfc3339()),
        ];

        let completed: Vec<&str> = state.results.keys().map(Stage::as_str).collect();
        if !completed.is_empty() {
            lines.push(format!("Completed: {}", completed.join(", ")));
        }
        if let Some(failure) = &state.failure {
            lines.push(format!(
                "Failed at {} after {} attempt(s): {}",
                failure.stage, failure.attempts, failure.error
            ));
        }
        if let Some(done) = state.completed_at {
            lines.push(format!("Finished: {}", done.to_rfc3339()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct WorkflowSummary {
    workflow_id: String,
    stage: Stage,
    keyword: String,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct WorkflowListOutput {
    workflows: Vec<WorkflowSummary>,
    total: usize,
}

impl CommandOutput for WorkflowListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "stage", "keyword", "updated"]);
        for wf in &self.workflows {
            table.add_row(vec![
                wf.workflow_id.clone(),
                wf.stage.to_string(),
                truncate(&wf.keyword, 40),
                wf.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
        }
        render_list("workflow", &table, self.total)
    }
}

#[derive(Debug, Serialize)]
struct CheckpointListOutput {
    workflow_id: String,
    checkpoints: Vec<CheckpointRecord>,
}

impl CommandOutput for CheckpointListOutput {
    fn to_human(&self) -> String {
        let mut table = list_table(&["id", "type", "stage", "created", "note"]);
        for record in &self.checkpoints {
            let note = record
                .metadata
                .get("note")
                .or_else(|| record.metadata.get("error"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            table.add_row(vec![
                record.checkpoint_id.to_string(),
                record.checkpoint_type.to_string(),
                record.state_snapshot.current_stage.to_string(),
                record.created_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
                truncate(note, 40),
            ]);
        }
        render_list("checkpoint", &table, self.checkpoints.len())
    }
}

#[derive(Debug, Serialize)]
struct RollbackOutput {
    workflow_id: String,
    checkpoint_id: Uuid,
    stage: Stage,
}

impl CommandOutput for RollbackOutput {
    fn to_human(&self) -> String {
        format!(
            "Workflow {} rolled back to checkpoint {}; it will resume at {}",
            self.workflow_id, self.checkpoint_id, self.stage
        )
    }
}

#[derive(Debug, Serialize)]
struct SnapshotOutput {
    workflow_id: String,
    checkpoint_id: Uuid,
}

impl CommandOutput for SnapshotOutput {
    fn to_human(&self) -> String {
        format!("Checkpoint {} written for {}", self.checkpoint_id, self.workflow_id)
    }
}

#[derive(Debug, Serialize)]
struct DeleteOutput {
    workflow_id: String,
    deleted: usize,
}

impl CommandOutput for DeleteOutput {
    fn to_human(&self) -> String {
        format!("Deleted {} checkpoint(s) of {}", self.deleted, self.workflow_id)
    }
}

#[derive(Debug, Serialize)]
struct PruneOutput {
    workflow_id: Option<String>,
    #[serde(flatten)]
    report: PruneReport,
}

impl CommandOutput for PruneOutput {
    fn to_human(&self) -> String {
        format!(
            "Pruned {} checkpoint(s) across {} workflow(s)",
            self.report.deleted, self.report.workflows_scanned
        )
    }
}

pub async fn status(service: &WorkflowService, workflow_id: &str, json_mode: bool) -> Result<()> {
    let state = service.get_status(workflow_id).await?;
    output(&StatusOutput { state }, json_mode);
    Ok(())
}

pub async fn list(service: &WorkflowService, stage: Option<Stage>, json_mode: bool) -> Result<()> {
    let workflows: Vec<WorkflowSummary> = service
        .list_workflows(stage)
        .await?
        .into_iter()
        .map(|state| WorkflowSummary {
            workflow_id: state.workflow_id,
            stage: state.current_stage,
            keyword: state.input.keyword,
            updated_at: state.updated_at,
        })
        .collect();
    let total = workflows.len();
    output(&WorkflowListOutput { workflows, total }, json_mode);
    Ok(())
}

pub async fn checkpoints(service: &WorkflowService, workflow_id: &str, json_mode: bool) -> Result<()> {
    let checkpoints = service.list_checkpoints(workflow_id).await?;
    output(
        &CheckpointListOutput {
            workflow_id: workflow_id.to_string(),
            checkpoints,
        },
        json_mode,
    );
    Ok(())
}

pub async fn rollback(
    service: &WorkflowService,
    workflow_id: &str,
    checkpoint_id: Uuid,
    json_mode: bool,
) -> Result<()> {
    let state = service.rollback(workflow_id, checkpoint_id).await?;
    output(
        &RollbackOutput {
            workflow_id: workflow_id.to_string(),
            checkpoint_id,
            stage: state.current_stage,
        },
        json_mode,
    );
    Ok(())
}

pub async fn snapshot(
    service: &WorkflowService,
    workflow_id: &str,
    note: Option<String>,
    json_mode: bool,
) -> Result<()> {
    let checkpoint_id = service.snapshot(workflow_id, note).await?;
    output(
        &SnapshotOutput {
            workflow_id: workflow_id.to_string(),
            checkpoint_id,
        },
        json_mode,
    );
    Ok(())
}

pub async fn delete(service: &WorkflowService, workflow_id: &str, yes: bool, json_mode: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete checkpoints of {workflow_id} without --yes");
    }
    let deleted = service.delete_checkpoints(workflow_id).await?;
    output(
        &DeleteOutput {
            workflow_id: workflow_id.to_string(),
            deleted,
        },
        json_mode,
    );
    Ok(())
}

pub async fn prune(service: &WorkflowService, workflow_id: Option<String>, json_mode: bool) -> Result<()> {
    let report = match &workflow_id {
        Some(id) => service.prune(id).await?,
        None => service.prune_all().await?,
    };
    output(&PruneOutput { workflow_id, report }, json_mode);
    Ok(())
}
