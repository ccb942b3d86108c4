//! Common test utilities for integration tests
//!
//! Shared fixtures for building services over in-memory or SQLite stores.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use kgflow::adapters::memory::{InMemoryCheckpointStore, InMemoryLeaseStore};
use kgflow::domain::models::{Config, DatabaseConfig, Stage};
use kgflow::domain::ports::{StageError, StageFn, StageHandler};
use kgflow::services::{StageRegistry, SupervisorSettings, WorkflowService};

/// Config with timings short enough for tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.fixed_delay_ms = 5;
    config.retry.attempt_timeout_ms = 5_000;
    config.lease.duration_ms = 2_000;
    config.lease.renew_interval_ms = 500;
    config.checkpoint.periodic_interval_ms = 60_000;
    config.checkpoint.prune_on_save = false;
    config
}

/// Database config pointing into a fresh temporary directory.
pub fn temp_database() -> (TempDir, DatabaseConfig) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = DatabaseConfig {
        path: dir.path().join("kgflow.db").to_string_lossy().into_owned(),
        max_connections: 2,
    };
    (dir, config)
}

/// Handler returning `{"stage": <stage>}`.
pub fn echo(stage: Stage) -> Arc<dyn StageHandler> {
    Arc::new(StageFn::new(move |_| async move { Ok(json!({ "stage": stage })) }))
}

/// Handler that counts its calls and otherwise behaves like [`echo`].
pub fn counting(stage: Stage, calls: Arc<AtomicU32>) -> Arc<dyn StageHandler> {
    Arc::new(StageFn::new(move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(json!({ "stage": stage })) }
    }))
}

/// Handler that always fails fatally.
pub fn fatal(message: &'static str) -> Arc<dyn StageHandler> {
    Arc::new(StageFn::new(move |_| async move { Err(StageError::fatal(message)) }))
}

/// Handler that sleeps for `delay` before succeeding.
pub fn slow(stage: Stage, delay: Duration) -> Arc<dyn StageHandler> {
    Arc::new(StageFn::new(move |_| async move {
        tokio::time::sleep(delay).await;
        Ok(json!({ "stage": stage }))
    }))
}

/// Every pipeline stage answered by [`echo`].
pub fn echo_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    for stage in Stage::PIPELINE {
        registry.register(stage, echo(stage)).expect("pipeline stage");
    }
    registry
}

/// In-memory stores shared between services, like two processes sharing a database.
#[derive(Clone, Default)]
pub struct SharedStores {
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub leases: Arc<InMemoryLeaseStore>,
}

impl SharedStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self, registry: StageRegistry) -> WorkflowService {
        self.service_with_config(registry, &test_config())
    }

    pub fn service_with_config(&self, registry: StageRegistry, config: &Config) -> WorkflowService {
        WorkflowService::with_parts(
            self.checkpoints.clone(),
            self.leases.clone(),
            registry,
            config,
            SupervisorSettings::from_config(config),
            kgflow::services::RetryExecutor::default(),
        )
    }
}

/// Poll `predicate` every 5ms until it holds or `timeout` passes.
pub async fn wait_for<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}

/// Route tracing output through the test harness.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
