pub mod checkpoint;
pub mod config;
pub mod lease;
pub mod workflow_state;

pub use checkpoint::{CheckpointMetadata, CheckpointRecord, CheckpointType, PruneReport, RetentionPolicy};
pub use config::{CheckpointConfig, Config, DatabaseConfig, LeaseConfig, LoggingConfig, RetryConfig};
pub use lease::LockLease;
pub use workflow_state::{Stage, StageFailure, WorkflowInput, WorkflowState};
