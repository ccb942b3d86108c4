//! Domain layer for the kgflow orchestration core
//!
//! Workflow state, checkpoints, leases, and the ports adapters implement.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
