//! Workflows persisted in an on-disk SQLite database.

mod common;

use std::time::Duration;

use common::{echo_registry, fatal, temp_database, test_config};
use kgflow::adapters::sqlite::{
    create_migrated_test_pool, initialize_database, Migrator, SqliteCheckpointStore, SqliteLeaseStore,
};
use kgflow::domain::models::{CheckpointType, Stage, WorkflowInput};
use kgflow::services::{LockManager, RunOutcome, WorkflowService};
use kgflow::DomainError;
use std::sync::Arc;

#[tokio::test]
async fn test_state_survives_reopen() {
    let (_dir, database) = temp_database();
    let config = test_config();

    {
        let pool = initialize_database(&database).await.unwrap();
        let service = WorkflowService::sqlite(pool.clone(), echo_registry(), &config);
        let outcome = service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
        assert!(outcome.is_completed());
        pool.close().await;
    }

    let pool = initialize_database(&database).await.unwrap();
    assert_eq!(Migrator::new(pool.clone()).current_version().await.unwrap(), 1);
    let service = WorkflowService::sqlite(pool, echo_registry(), &config);

    let status = service.get_status("wf-1").await.unwrap();
    assert_eq!(status.current_stage, Stage::Done);
    assert_eq!(status.results.len(), 5);

    let completions = service
        .list_checkpoints("wf-1")
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.checkpoint_type == CheckpointType::StageCompletion)
        .count();
    assert_eq!(completions, 5);

    let lease = service.locks().await.unwrap().pop().unwrap();
    assert!(lease.released);
    assert_eq!(lease.fencing_token, 1);
}

#[tokio::test]
async fn test_resume_after_crash_in_second_process() {
    let (_dir, database) = temp_database();
    let config = test_config();

    // first process fails at retrieval
    let first_pool = initialize_database(&database).await.unwrap();
    let mut broken = echo_registry();
    broken.register(Stage::Retrieval, fatal("index offline")).unwrap();
    let first = WorkflowService::sqlite(first_pool, broken, &config);
    let outcome = first.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    // second process rolls back and finishes
    let second_pool = initialize_database(&database).await.unwrap();
    let second = WorkflowService::sqlite(second_pool, echo_registry(), &config);
    let resume_point = second
        .list_checkpoints("wf-1")
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.state_snapshot.current_stage == Stage::Retrieval)
        .unwrap();
    second.rollback("wf-1", resume_point.checkpoint_id).await.unwrap();

    let outcome = second.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
    assert!(outcome.is_completed());
    assert_eq!(first.get_status("wf-1").await.unwrap().current_stage, Stage::Done);
}

#[tokio::test]
async fn test_lease_shared_between_pools() {
    let (_dir, database) = temp_database();
    let config = test_config();

    let holder_pool = initialize_database(&database).await.unwrap();
    let holder = LockManager::new(Arc::new(SqliteLeaseStore::new(holder_pool)));
    let stale = holder
        .acquire("wf-1", "process-a", Duration::from_millis(50))
        .await
        .unwrap();

    let pool = initialize_database(&database).await.unwrap();
    let service = WorkflowService::sqlite(pool, echo_registry(), &config);
    let err = service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap_err();
    assert!(matches!(err, DomainError::WorkflowBusy { .. }));

    tokio::time::sleep(Duration::from_millis(80)).await;
    let outcome = service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
    assert!(outcome.is_completed());

    let lease = service.locks().await.unwrap().pop().unwrap();
    assert_eq!(lease.fencing_token, stale.fencing_token + 1);
}

#[tokio::test]
async fn test_prune_applies_retention() {
    let pool = create_migrated_test_pool().await.unwrap();
    let mut config = test_config();
    config.checkpoint.max_per_workflow = 2;
    config.checkpoint.max_age_hours = 0;
    let service = WorkflowService::new(
        Arc::new(SqliteCheckpointStore::new(pool.clone())),
        Arc::new(SqliteLeaseStore::new(pool)),
        echo_registry(),
        &config,
    );

    service.start_or_resume("wf-1", WorkflowInput::new("ai")).await.unwrap();
    service.start_or_resume("wf-2", WorkflowInput::new("ml")).await.unwrap();

    let report = service.prune("wf-1").await.unwrap();
    assert_eq!(report.workflows_scanned, 1);
    assert_eq!(report.deleted, 3);

    let report = service.prune_all().await.unwrap();
    assert_eq!(report.workflows_scanned, 2);
    assert_eq!(report.deleted, 3);

    for id in ["wf-1", "wf-2"] {
        let remaining = service.list_checkpoints(id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.last().unwrap().state_snapshot.current_stage, Stage::Done);
    }
}

#[tokio::test]
async fn test_health_reports_store() {
    let pool = create_migrated_test_pool().await.unwrap();
    let service = WorkflowService::sqlite(pool.clone(), echo_registry(), &test_config());
    assert!(service.health().await.healthy);

    pool.close().await;
    let report = service.health().await;
    assert!(!report.healthy);
    assert!(!report.store_reachable);
}
