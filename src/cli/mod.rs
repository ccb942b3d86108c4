//! Command-line interface
//!
//! The CLI inspects and repairs workflows in the configured store. Stage
//! handlers belong to the embedding application, so it never runs stages.

pub mod commands;
pub mod output;
pub mod types;

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;

pub use types::{Cli, Commands};

use crate::adapters::sqlite::initialize_database;
use crate::domain::models::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{LogConfig, LoggerImpl};
use crate::services::{StageRegistry, WorkflowService};

/// Load configuration from `path`, or from the project files when absent.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Parse-independent entry point: load config, start logging, run the command.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let _logger = LoggerImpl::init(&LogConfig::from(&config.logging))?;

    let pool = initialize_database(&config.database)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;
    let service = WorkflowService::sqlite(pool, StageRegistry::new(), &config);

    dispatch(&service, cli.command, cli.json).await
}

pub async fn dispatch(service: &WorkflowService, command: Commands, json_mode: bool) -> Result<()> {
    match command {
        Commands::Status { workflow_id } => commands::workflow::status(service, &workflow_id, json_mode).await,
        Commands::List { stage } => commands::workflow::list(service, stage, json_mode).await,
        Commands::Checkpoints { workflow_id } => {
            commands::workflow::checkpoints(service, &workflow_id, json_mode).await
        }
        Commands::Rollback {
            workflow_id,
            checkpoint_id,
        } => commands::workflow::rollback(service, &workflow_id, checkpoint_id, json_mode).await,
        Commands::Snapshot { workflow_id, note } => {
            commands::workflow::snapshot(service, &workflow_id, note, json_mode).await
        }
        Commands::Delete { workflow_id, yes } => {
            commands::workflow::delete(service, &workflow_id, yes, json_mode).await
        }
        Commands::Prune { workflow_id } => commands::workflow::prune(service, workflow_id, json_mode).await,
        Commands::Locks => commands::lock::list(service, json_mode).await,
        Commands::Unlock { workflow_id } => commands::lock::unlock(service, &workflow_id, json_mode).await,
        Commands::Health => commands::health::execute(service, json_mode).await,
    }
}

/// Print `err` in the selected format and exit with status 1.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = json!({ "error": format!("{err:#}") });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1)
}
