use std::sync::Arc;

use fleet_config::DatabaseConfig;
use fleet_core::{
    Execution, ExecutionRepository, ExecutionStatus, GroupRepository, Task, TaskKind,
    TaskRepository, TaskStatus, WorkflowRepository,
};
use fleet_infrastructure::DatabaseManager;
use fleet_testing_utils::{GroupBuilder, WorkflowBuilder};
use serde_json::json;

async fn file_database(dir: &tempfile::TempDir) -> DatabaseManager {
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("fleet.db").display()),
        max_connections: 8,
        ..DatabaseConfig::default()
    };
    DatabaseManager::new(&config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_or_create_yields_single_execution() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_database(&dir).await;
    let group = manager
        .group_repository()
        .create(&GroupBuilder::new("all").build())
        .await
        .unwrap();
    let workflow = manager
        .workflow_repository()
        .create(&WorkflowBuilder::new("reboot", group.id).build())
        .await
        .unwrap();

    let executions: Arc<dyn ExecutionRepository> = manager.execution_repository();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let executions = executions.clone();
        let workflow_id = workflow.id;
        handles.push(tokio::spawn(async move {
            executions
                .get_or_create(&Execution::new(workflow_id, "CPE-1", ExecutionStatus::Pending))
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    let mut ids = Vec::new();
    for handle in handles {
        let (execution, was_created) = handle.await.unwrap();
        if was_created {
            created += 1;
        }
        ids.push(execution.id);
    }
    ids.dedup();

    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
    assert_eq!(executions.list_for_workflow(workflow.id).await.unwrap().len(), 1);
    manager.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_task_transitions_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_database(&dir).await;
    let tasks: Arc<dyn TaskRepository> = manager.task_repository();
    let task = tasks
        .create(&Task::new("CPE-1", TaskKind::Reboot, json!({})))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let tasks = tasks.clone();
        let mut next = task.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                next.status = TaskStatus::Sent;
            } else {
                next.status = TaskStatus::Cancelled;
            }
            tasks
                .compare_and_set(&next, TaskStatus::Pending)
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let stored = tasks.get(task.id).await.unwrap().unwrap();
    assert_ne!(stored.status, TaskStatus::Pending);
    manager.close().await;
}
