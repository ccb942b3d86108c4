//! Port trait definitions (Hexagonal Architecture)
//!
//! Interfaces the orchestration core depends on:
//! - CheckpointStore: append-only checkpoint persistence
//! - LeaseStore: compare-and-swap lease rows
//! - StageHandler: the work behind each pipeline stage
//! - RetryObserver: hook notified on failed attempts

pub mod checkpoint_store;
pub mod lease_store;
pub mod retry_observer;
pub mod stage_handler;

pub use checkpoint_store::CheckpointStore;
pub use lease_store::LeaseStore;
pub use retry_observer::{RetryContext, RetryObserver};
pub use stage_handler::{StageError, StageFn, StageHandler};
