//! CLI type definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::domain::models::Stage;

#[derive(Parser, Debug)]
#[command(name = "kgflow")]
#[command(about = "kgflow - workflow checkpoints, leases and recovery", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Configuration file (defaults to .kgflow/config.yaml and .kgflow/local.yaml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the current state of a workflow
    Status {
        workflow_id: String,
    },

    /// List known workflows
    List {
        /// Only workflows currently at this stage
        #[arg(short, long, value_parser = parse_stage)]
        stage: Option<Stage>,
    },

    /// List the checkpoints of a workflow, oldest first
    Checkpoints {
        workflow_id: String,
    },

    /// Make an earlier checkpoint the resume point
    Rollback {
        workflow_id: String,
        checkpoint_id: Uuid,
    },

    /// Write a manual checkpoint of the current state
    Snapshot {
        workflow_id: String,

        /// Free-form note stored with the checkpoint
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Delete every checkpoint of a workflow
    Delete {
        workflow_id: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Apply the retention policy to one workflow, or to all of them
    Prune {
        workflow_id: Option<String>,
    },

    /// List workflow leases
    Locks,

    /// Release a lease left behind by a dead process
    Unlock {
        workflow_id: String,
    },

    /// Check that the store is reachable
    Health,
}

fn parse_stage(s: &str) -> Result<Stage, String> {
    s.parse().map_err(|e: crate::domain::errors::DomainError| e.to_string())
}
