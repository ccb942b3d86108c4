//! In-memory adapters for tests and embedded use.

pub mod checkpoint_store;
pub mod lease_store;

pub use checkpoint_store::InMemoryCheckpointStore;
pub use lease_store::InMemoryLeaseStore;
