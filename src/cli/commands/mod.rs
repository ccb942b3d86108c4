//! CLI command implementations.

pub mod health;
pub mod lock;
pub mod workflow;
