mod common;

use std::time::Duration;

use tokio::sync::broadcast;

use common::Harness;
use fleet_core::ExecutionStatus;
use fleet_dispatcher::TaskReport;
use fleet_testing_utils::WorkflowBuilder;

#[tokio::test]
async fn test_listener_applies_events_until_shutdown() {
    let mut h = Harness::new();
    h.connect("CPE-1", "X1").await;
    h.connect("CPE-2", "X1").await;
    let group = h.model_group("x1", "X1").await;
    let workflow = h
        .start_workflow(WorkflowBuilder::new("reboot", group.id).build())
        .await;

    let Harness {
        controller,
        executions,
        listener,
        ..
    } = h;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(listener.run(shutdown_rx));

    let task = controller.deliver_next_task("CPE-1").await.unwrap().unwrap();
    controller
        .report_task_result(task.id, TaskReport::success(None))
        .await
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let done = executions
                .all_executions()
                .iter()
                .any(|e| e.device_id == "CPE-1" && e.status == ExecutionStatus::Completed);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(completed.is_ok(), "监听器未处理任务事件");

    // 关闭前已发布的事件在退出前处理完
    controller.deliver_next_task("CPE-2").await.unwrap().unwrap();
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("监听器未在关闭信号后退出")
        .unwrap();

    let cpe2 = executions
        .all_executions()
        .into_iter()
        .find(|e| e.workflow_id == workflow.id && e.device_id == "CPE-2")
        .unwrap();
    assert_eq!(cpe2.status, ExecutionStatus::InProgress);
}
