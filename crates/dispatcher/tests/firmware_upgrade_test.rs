mod common;

use serde_json::{json, Value};

use common::Harness;
use fleet_config::SchedulerConfig;
use fleet_core::{ExecutionStatus, TaskKind, WorkflowStatus};
use fleet_dispatcher::TaskReport;
use fleet_testing_utils::WorkflowBuilder;

fn with_upgrade_graph(h: &Harness) {
    h.firmware.add_image("hgw", "V2", false);
    h.firmware.add_image("hgw", "V3", true);
    h.firmware.add_edge("hgw", "V1", "V2");
    h.firmware.add_edge("hgw", "V2", "V3");
}

async fn connect_on(h: &mut Harness, device_id: &str, firmware: &str) {
    h.connect_with(
        device_id,
        &[
            ("model", json!("X1")),
            ("device_type", json!("hgw")),
            ("firmware_version", json!(firmware)),
        ],
    )
    .await;
}

fn firmware_workflow(group_id: i64) -> fleet_core::Workflow {
    WorkflowBuilder::new("upgrade", group_id)
        .with_task(TaskKind::DownloadFirmware, json!({}))
        .build()
}

#[tokio::test]
async fn test_multi_hop_upgrade_waits_for_each_hop() {
    let mut h = Harness::new();
    with_upgrade_graph(&h);
    connect_on(&mut h, "CPE-1", "V1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h.start_workflow(firmware_workflow(group.id)).await;

    let first = h.deliver("CPE-1").await.unwrap();
    assert_eq!(first.payload["target_version"], json!("V2"));
    assert_eq!(first.payload["final_version"], json!("V3"));
    assert_eq!(first.payload["hop_index"], json!(1));
    assert_eq!(
        first.payload["download_ref"],
        json!("https://firmware.example/hgw/V2.bin")
    );
    h.report(first.id, TaskReport::success(None)).await;

    let waiting = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(waiting.status, ExecutionStatus::InProgress);
    assert_eq!(waiting.result.as_ref().unwrap()["awaiting_version"], json!("V2"));
    assert_eq!(
        h.progress(workflow.id).await.status,
        Some(WorkflowStatus::Active)
    );

    // 设备重启后以新版本重新连接
    h.disconnect("CPE-1").await;
    connect_on(&mut h, "CPE-1", "V2").await;

    let second = h.deliver("CPE-1").await.unwrap();
    assert_eq!(second.payload["target_version"], json!("V3"));
    assert_eq!(second.payload["hop_index"], json!(2));
    h.report(second.id, TaskReport::success(None)).await;

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.attempts, 1);
    assert_eq!(
        h.progress(workflow.id).await.status,
        Some(WorkflowStatus::Completed)
    );

    let versions: Vec<Value> = h
        .device_tasks("CPE-1")
        .await
        .iter()
        .map(|task| task.payload["target_version"].clone())
        .collect();
    assert_eq!(versions, vec![json!("V2"), json!("V3")]);
}

#[tokio::test]
async fn test_hop_that_did_not_register_fails_execution() {
    let mut h = Harness::new();
    with_upgrade_graph(&h);
    connect_on(&mut h, "CPE-1", "V1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h.start_workflow(firmware_workflow(group.id)).await;

    h.complete_next("CPE-1").await;
    h.disconnect("CPE-1").await;
    connect_on(&mut h, "CPE-1", "V1").await;

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.result.unwrap()["error"].as_str().unwrap().to_string();
    assert!(error.contains("V2"), "unexpected error: {error}");
    assert_eq!(h.tasks.count(), 1);
}

#[tokio::test]
async fn test_upgrade_beyond_hop_limit_is_configuration_error() {
    let mut h = Harness::with_scheduler_config(SchedulerConfig {
        max_firmware_hops: 1,
        ..SchedulerConfig::default()
    });
    with_upgrade_graph(&h);
    connect_on(&mut h, "CPE-1", "V1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("upgrade", group.id)
                .with_task(TaskKind::DownloadFirmware, json!({}))
                .with_retries(3, 0)
                .build(),
        )
        .await;

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempts, 1);
    assert_eq!(execution.result.unwrap()["configuration_error"], json!(true));
    assert_eq!(h.tasks.count(), 0);
}

#[tokio::test]
async fn test_unreachable_target_fails_without_retry() {
    let mut h = Harness::new();
    with_upgrade_graph(&h);
    connect_on(&mut h, "CPE-1", "V0").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("upgrade", group.id)
                .with_task(TaskKind::DownloadFirmware, json!({"target_version": "V3"}))
                .with_retries(2, 0)
                .build(),
        )
        .await;

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.tasks.count(), 0);
}

#[tokio::test]
async fn test_device_already_on_target_completes_without_task() {
    let mut h = Harness::new();
    with_upgrade_graph(&h);
    connect_on(&mut h, "CPE-1", "V3").await;
    connect_on(&mut h, "CPE-2", "V2").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h.start_workflow(firmware_workflow(group.id)).await;

    assert_eq!(
        h.execution(workflow.id, "CPE-1").await.status,
        ExecutionStatus::Completed
    );
    let task = h.deliver("CPE-2").await.unwrap();
    assert_eq!(task.payload["target_version"], json!("V3"));
    assert_eq!(h.tasks.count(), 1);
}
