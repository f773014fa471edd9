use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use fleet_dispatcher::FleetController;

use crate::handlers::{
    adapter::{deliver_next_task, device_connected, device_disconnected, report_task_result},
    groups::{create_group, get_group, group_devices, list_groups, preview_group, update_group},
    health::health_check,
    tasks::{cancel_task, create_device_task, get_task, list_device_tasks, retry_task},
    workflows::{
        activate_workflow, cancel_workflow, create_workflow, get_workflow, list_workflows,
        pause_workflow, resume_workflow, workflow_executions, workflow_progress,
    },
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FleetController>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 协议适配器钩子
        .route("/adapter/devices/{id}/connected", post(device_connected))
        .route("/adapter/devices/{id}/disconnected", post(device_disconnected))
        .route("/adapter/devices/{id}/next-task", post(deliver_next_task))
        .route("/adapter/tasks/{id}/result", post(report_task_result))
        // 设备分组
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/preview", post(preview_group))
        .route("/api/groups/{id}", get(get_group).put(update_group))
        .route("/api/groups/{id}/devices", get(group_devices))
        // 工作流
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/activate", post(activate_workflow))
        .route("/api/workflows/{id}/pause", post(pause_workflow))
        .route("/api/workflows/{id}/resume", post(resume_workflow))
        .route("/api/workflows/{id}/cancel", post(cancel_workflow))
        .route("/api/workflows/{id}/progress", get(workflow_progress))
        .route("/api/workflows/{id}/executions", get(workflow_executions))
        // 设备任务
        .route(
            "/api/devices/{id}/tasks",
            get(list_device_tasks).post(create_device_task),
        )
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .with_state(state)
}
