//! kgflow - workflow orchestration core
//!
//! Drives a knowledge-graph pipeline (research, extraction, retrieval,
//! synthesis, visualization) with crash recovery:
//!
//! - **Leases** with fencing tokens keep one execution per workflow
//! - **Checkpoints** record every stage completion, failure and periodic progress
//! - **Fixed-delay retries** wrap every stage handler call
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, errors and ports
//! - **Adapters** (`adapters`): `SQLite` and in-memory stores
//! - **Service Layer** (`services`): supervisor, managers and the [`WorkflowService`] facade
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): inspection and repair commands
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kgflow::{Config, Stage, StageFn, StageRegistry, WorkflowInput, WorkflowService};
//!
//! let mut registry = StageRegistry::new();
//! for stage in Stage::PIPELINE {
//!     registry.register(stage, Arc::new(StageFn::new(|_| async { Ok(serde_json::json!({})) })))?;
//! }
//! let pool = kgflow::adapters::sqlite::initialize_database(&config.database).await?;
//! let service = WorkflowService::sqlite(pool, registry, &config);
//! let outcome = service.start_or_resume("wf-1", WorkflowInput::new("graph databases")).await?;
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    CheckpointRecord, CheckpointType, Config, LockLease, RetentionPolicy, Stage, StageFailure, WorkflowInput,
    WorkflowState,
};
pub use domain::ports::{CheckpointStore, LeaseStore, RetryObserver, StageError, StageFn, StageHandler};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    CancellationFlag, HealthReport, RetryPolicy, RunOutcome, StageRegistry, SupervisorSettings, WorkflowService,
};
