mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use common::Harness;
use fleet_config::TaskTimeoutConfig;
use fleet_core::{ExecutionStatus, TaskKind, TaskStatus, WorkflowRepository, WorkflowStatus};
use fleet_dispatcher::{SchedulerTrigger, TaskReport};
use fleet_testing_utils::WorkflowBuilder;

#[tokio::test]
async fn test_repeated_triggers_create_one_execution_per_device() {
    let mut h = Harness::new();
    for id in ["CPE-1", "CPE-2", "CPE-3"] {
        h.connect(id, "X1").await;
    }
    h.connect("CPE-9", "Y1").await;
    let group = h.model_group("x1", "X1").await;

    let workflow = h
        .start_workflow(WorkflowBuilder::new("reboot", group.id).build())
        .await;

    for _ in 0..3 {
        h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
    }
    h.connect("CPE-1", "X1").await;

    let executions = h.controller.workflow_executions(workflow.id).await.unwrap();
    let mut devices: Vec<String> = executions.iter().map(|e| e.device_id.clone()).collect();
    devices.sort();
    devices.dedup();
    assert_eq!(executions.len(), 3);
    assert_eq!(devices, vec!["CPE-1", "CPE-2", "CPE-3"]);
    assert_eq!(h.tasks.count(), 3);
}

#[tokio::test]
async fn test_immediate_workflow_completes_after_all_devices_succeed() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    h.connect("CPE-2", "X1").await;
    let group = h.model_group("x1", "X1").await;

    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("set-ssid", group.id)
                .with_task(
                    TaskKind::SetParameters,
                    json!({"values": {"Device.WiFi.SSID.1.SSID": "fleet"}}),
                )
                .build(),
        )
        .await;
    assert_eq!(h.progress(workflow.id).await.queued, 2);

    let task = h.deliver("CPE-1").await.unwrap();
    assert_eq!(task.kind, TaskKind::SetParameters);
    assert_eq!(h.execution(workflow.id, "CPE-1").await.status, ExecutionStatus::InProgress);
    h.report(task.id, TaskReport::success(None)).await;

    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.queued, 1);
    assert_eq!(progress.status, Some(WorkflowStatus::Active));

    h.complete_next("CPE-2").await;
    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.status, Some(WorkflowStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_concurrent_holds_under_concurrent_triggers() {
    let mut h = Harness::new();
    for i in 0..10 {
        h.connect(&format!("CPE-{i:02}"), "X1").await;
    }
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("reboot", group.id)
                .with_max_concurrent(3)
                .build(),
        )
        .await;

    loop {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let scheduler = Arc::clone(&h.scheduler);
                tokio::spawn(async move { scheduler.handle(SchedulerTrigger::Tick).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        h.settle().await;

        let progress = h.progress(workflow.id).await;
        assert!(
            progress.queued + progress.in_progress <= 3,
            "在途执行数超过上限: {progress:?}"
        );
        if progress.status == Some(WorkflowStatus::Completed) {
            break;
        }

        let queued = h.devices_with(workflow.id, ExecutionStatus::Queued);
        assert!(!queued.is_empty(), "工作流未完成但没有在途执行: {progress:?}");
        for device_id in queued {
            h.complete_next(&device_id).await;
        }
    }

    assert_eq!(h.progress(workflow.id).await.completed, 10);
    assert_eq!(h.tasks.count(), 10);
}

#[tokio::test]
async fn test_failure_threshold_pauses_workflow_and_holds_queued_tasks() {
    let mut h = Harness::new();
    for i in 0..10 {
        h.connect(&format!("CPE-{i:02}"), "X1").await;
    }
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("firmware-config", group.id)
                .with_max_concurrent(6)
                .stop_on_failure_percent(50)
                .build(),
        )
        .await;

    let queued = h.devices_with(workflow.id, ExecutionStatus::Queued);
    assert_eq!(queued.len(), 6);

    h.fail_next(&queued[0], "9002 Internal error").await;
    assert_eq!(
        h.progress(workflow.id).await.status,
        Some(WorkflowStatus::Paused)
    );

    // 熔断后已排队的任务不再下发给设备
    for device_id in &queued[1..] {
        assert!(h.deliver(device_id).await.is_none());
    }
    assert_eq!(h.tasks.count_with_status(TaskStatus::Sent), 0);
    assert_eq!(h.tasks.count_with_status(TaskStatus::Pending), 5);

    h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
    h.settle().await;

    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.status, Some(WorkflowStatus::Paused));
    assert_eq!(progress.failed, 1);
    assert_eq!(progress.queued, 5);
    assert_eq!(progress.pending, 4);
    assert_eq!(h.tasks.count(), 6);

    // 失败率仍然超过阈值，恢复后立即再次暂停
    h.controller.resume_workflow(workflow.id).await.unwrap();
    h.settle().await;
    assert_eq!(
        h.progress(workflow.id).await.status,
        Some(WorkflowStatus::Paused)
    );
    assert!(h.deliver(&queued[1]).await.is_none());
    assert_eq!(h.tasks.count(), 6);
}

#[tokio::test]
async fn test_resumed_workflow_delivers_held_tasks() {
    let mut h = Harness::new();
    for id in ["CPE-1", "CPE-2"] {
        h.connect(id, "X1").await;
    }
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(WorkflowBuilder::new("reboot", group.id).build())
        .await;

    h.controller.pause_workflow(workflow.id).await.unwrap();
    assert!(h.deliver("CPE-1").await.is_none());
    assert!(h.deliver("CPE-2").await.is_none());

    h.controller.resume_workflow(workflow.id).await.unwrap();
    h.settle().await;
    h.complete_next("CPE-1").await;
    h.complete_next("CPE-2").await;

    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.status, Some(WorkflowStatus::Completed));
    assert_eq!(h.tasks.count(), 2);
}

#[tokio::test]
async fn test_failed_attempt_is_retried_up_to_retry_count() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("reboot", group.id)
                .with_retries(2, 0)
                .build(),
        )
        .await;

    h.fail_next("CPE-1", "reboot refused").await;
    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert_eq!(execution.attempts, 2);

    h.fail_next("CPE-1", "reboot refused").await;
    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.result, Some(json!({"error": "reboot refused"})));
    assert_eq!(h.tasks.count(), 2);
    assert_eq!(
        h.progress(workflow.id).await.status,
        Some(WorkflowStatus::Completed)
    );
}

#[tokio::test]
async fn test_retry_count_of_one_fails_after_first_attempt() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("reboot", group.id)
                .with_retries(1, 0)
                .build(),
        )
        .await;

    h.fail_next("CPE-1", "reboot refused").await;
    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.attempts, 1);
    assert_eq!(h.tasks.count(), 1);
}

#[tokio::test]
async fn test_retry_waits_for_retry_delay() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("reboot", group.id)
                .with_retries(3, 30)
                .build(),
        )
        .await;

    h.fail_next("CPE-1", "busy").await;
    h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert!(execution.next_retry_at.unwrap() > Utc::now() + Duration::minutes(29));
    assert_eq!(h.tasks.count(), 1);
}

#[tokio::test]
async fn test_rate_limit_caps_tasks_per_hour() {
    let mut h = Harness::new();
    for i in 0..5 {
        h.connect(&format!("CPE-{i}"), "X1").await;
    }
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("reboot", group.id)
                .with_rate_limit(2)
                .build(),
        )
        .await;
    assert_eq!(h.tasks.count(), 2);

    for device_id in h.devices_with(workflow.id, ExecutionStatus::Queued) {
        h.complete_next(&device_id).await;
    }
    h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();

    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.pending, 3);
    assert_eq!(h.tasks.count(), 2);
}

#[tokio::test]
async fn test_dependent_workflow_waits_for_predecessor_per_device() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    h.connect("CPE-2", "X1").await;
    let group = h.model_group("x1", "X1").await;

    let first = h
        .start_workflow(
            WorkflowBuilder::new("fetch", group.id)
                .with_task(TaskKind::FetchParameters, json!({}))
                .build(),
        )
        .await;
    let second = h
        .start_workflow(
            WorkflowBuilder::new("reboot-after-fetch", group.id)
                .depends_on(first.id)
                .build(),
        )
        .await;

    assert_eq!(h.execution(second.id, "CPE-1").await.status, ExecutionStatus::Skipped);
    assert_eq!(h.execution(second.id, "CPE-2").await.status, ExecutionStatus::Skipped);

    // CPE-1 上的前置执行成功后，后继执行立即准入
    h.complete_next("CPE-1").await;
    assert_eq!(h.execution(second.id, "CPE-1").await.status, ExecutionStatus::Queued);
    assert_eq!(h.execution(second.id, "CPE-2").await.status, ExecutionStatus::Skipped);

    // CPE-2 上的前置执行失败，后继执行保持跳过
    h.fail_next("CPE-2", "timeout reading parameters").await;
    h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
    assert_eq!(h.execution(second.id, "CPE-2").await.status, ExecutionStatus::Skipped);
    assert_eq!(
        h.progress(first.id).await.status,
        Some(WorkflowStatus::Completed)
    );

    let reboot = h.complete_next("CPE-1").await;
    assert_eq!(reboot.kind, TaskKind::Reboot);
    let progress = h.progress(second.id).await;
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.skipped, 1);
    assert_eq!(progress.status, Some(WorkflowStatus::Completed));
    assert!(h
        .device_tasks("CPE-2")
        .await
        .iter()
        .all(|task| task.kind != TaskKind::Reboot));
}

#[tokio::test]
async fn test_scheduled_workflow_waits_for_start_time() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;

    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("night-reboot", group.id)
                .scheduled_at(Utc::now() + Duration::hours(1))
                .build(),
        )
        .await;
    assert_eq!(h.progress(workflow.id).await.total, 0);

    let mut stored = h.workflows.get(workflow.id).await.unwrap().unwrap();
    stored.scheduled_at = Some(Utc::now() - Duration::minutes(1));
    h.workflows.update(&stored).await.unwrap();

    h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.total, 1);
    assert_eq!(progress.queued, 1);
}

#[tokio::test]
async fn test_recurring_workflow_rearms_finished_executions() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("hourly-fetch", group.id)
                .with_task(TaskKind::FetchParameters, json!({"names": ["Device.DeviceInfo."]}))
                .recurring("0 * * * * *")
                .repeat_per_device()
                .build(),
        )
        .await;

    for round in 1..=2 {
        let mut stored = h.workflows.get(workflow.id).await.unwrap().unwrap();
        stored.last_fired_at = Some(Utc::now() - Duration::minutes(2));
        h.workflows.update(&stored).await.unwrap();

        h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
        h.settle().await;
        h.complete_next("CPE-1").await;
        assert_eq!(h.tasks.count(), round);
    }

    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.total, 1);
    assert_eq!(progress.completed, 1);
    assert_eq!(progress.status, Some(WorkflowStatus::Active));
}

#[tokio::test]
async fn test_recurring_run_once_does_not_repeat() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(
            WorkflowBuilder::new("once", group.id)
                .recurring("0 * * * * *")
                .build(),
        )
        .await;

    for _ in 0..2 {
        let mut stored = h.workflows.get(workflow.id).await.unwrap().unwrap();
        stored.last_fired_at = Some(Utc::now() - Duration::minutes(2));
        h.workflows.update(&stored).await.unwrap();
        h.scheduler.handle(SchedulerTrigger::Tick).await.unwrap();
        h.settle().await;
        if h.execution(workflow.id, "CPE-1").await.status == ExecutionStatus::Queued {
            h.complete_next("CPE-1").await;
        }
    }

    assert_eq!(h.tasks.count(), 1);
}

#[tokio::test]
async fn test_cancel_workflow_cancels_open_tasks_and_ignores_late_results() {
    let mut h = Harness::new();
    for id in ["CPE-1", "CPE-2", "CPE-3"] {
        h.connect(id, "X1").await;
    }
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(WorkflowBuilder::new("reboot", group.id).build())
        .await;

    let sent = h.deliver("CPE-1").await.unwrap();
    h.controller.cancel_workflow(workflow.id).await.unwrap();
    h.settle().await;

    assert_eq!(h.tasks.count_with_status(TaskStatus::Cancelled), 3);
    assert_eq!(h.tasks.status_of(sent.id), Some(TaskStatus::Cancelled));

    // 已下发任务被取消后不会因超时退回待下发
    let report = h
        .state_machine
        .sweep_timeouts(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.resent + report.failed, 0);
    assert!(h.deliver("CPE-1").await.is_none());

    h.report(sent.id, TaskReport::success(None)).await;
    assert_eq!(h.tasks.status_of(sent.id), Some(TaskStatus::Cancelled));
    let progress = h.progress(workflow.id).await;
    assert_eq!(progress.status, Some(WorkflowStatus::Cancelled));
    assert_eq!(progress.cancelled, 3);
    assert_eq!(progress.completed, 0);
}

#[tokio::test]
async fn test_timed_out_task_fails_execution_after_resend_cap() {
    let mut h = Harness::with_timeouts(TaskTimeoutConfig {
        max_resends: 2,
        ..TaskTimeoutConfig::default()
    });
    h.connect("CPE-1", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(WorkflowBuilder::new("reboot", group.id).build())
        .await;

    for round in 1..=2 {
        let task = h.deliver("CPE-1").await.unwrap();
        assert_eq!(task.resend_count, round - 1);
        let report = h
            .state_machine
            .sweep_timeouts(Utc::now() + Duration::hours(2))
            .await
            .unwrap();
        h.settle().await;
        if round == 1 {
            assert_eq!(report.resent, 1);
            assert_eq!(
                h.execution(workflow.id, "CPE-1").await.status,
                ExecutionStatus::InProgress
            );
        } else {
            assert_eq!(report.failed, 1);
        }
    }

    let execution = h.execution(workflow.id, "CPE-1").await;
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(h.tasks.count(), 1);
}
