use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use fleet_core::{ScheduleMode, TaskKind, Workflow};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 工作流创建请求
///
/// 新工作流总是草稿状态，需要单独调用 activate 才开始调度。
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    pub group_id: i64,
    pub task_kind: TaskKind,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default = "default_schedule_mode")]
    pub schedule_mode: ScheduleMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub rate_limit: u32,
    #[serde(default)]
    pub max_concurrent: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retry_delay_minutes: u32,
    #[serde(default)]
    pub stop_on_failure_percent: u32,
    pub depends_on_workflow_id: Option<i64>,
    #[serde(default = "default_run_once")]
    pub run_once_per_device: bool,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_schedule_mode() -> ScheduleMode {
    ScheduleMode::Immediate
}

fn default_run_once() -> bool {
    true
}

impl From<CreateWorkflowRequest> for Workflow {
    fn from(request: CreateWorkflowRequest) -> Self {
        let mut workflow = Workflow::new(
            request.name,
            request.group_id,
            request.task_kind,
            request.parameters,
        );
        workflow.schedule_mode = request.schedule_mode;
        workflow.scheduled_at = request.scheduled_at;
        workflow.cron_expression = request.cron_expression;
        workflow.rate_limit = request.rate_limit;
        workflow.max_concurrent = request.max_concurrent;
        workflow.retry_count = request.retry_count;
        workflow.retry_delay_minutes = request.retry_delay_minutes;
        workflow.stop_on_failure_percent = request.stop_on_failure_percent;
        workflow.depends_on_workflow_id = request.depends_on_workflow_id;
        workflow.run_once_per_device = request.run_once_per_device;
        workflow
    }
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflowRequest>,
) -> ApiResult<impl IntoResponse> {
    let workflow = state.controller.create_workflow(request.into()).await?;
    Ok(created(workflow))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.get_workflow(workflow_id).await?))
}

pub async fn list_workflows(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.list_workflows().await?))
}

pub async fn activate_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.activate_workflow(workflow_id).await?))
}

pub async fn pause_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.pause_workflow(workflow_id).await?))
}

pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.resume_workflow(workflow_id).await?))
}

/// 取消工作流，未结束的执行一并取消
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.cancel_workflow(workflow_id).await?))
}

pub async fn workflow_progress(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.workflow_progress(workflow_id).await?))
}

pub async fn workflow_executions(
    State(state): State<AppState>,
    Path(workflow_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(
        state.controller.workflow_executions(workflow_id).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults_to_immediate_run_once() {
        let request: CreateWorkflowRequest =
            serde_json::from_str(r#"{"name": "reboot-all", "group_id": 1, "task_kind": "REBOOT"}"#)
                .unwrap();
        let workflow = Workflow::from(request);

        assert_eq!(workflow.schedule_mode, ScheduleMode::Immediate);
        assert!(workflow.run_once_per_device);
        assert!(workflow.parameters.is_object());
        assert_eq!(workflow.max_concurrent, 0);
    }
}
