use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::Task;
use fleet_dispatcher::TaskReport;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{ApiError, ApiResult},
    response::{no_content, success, ApiResponse},
    routes::AppState,
};

/// 设备连接上报
#[derive(Debug, Default, Deserialize)]
pub struct DeviceConnectedRequest {
    /// 本次会话上报的属性，未上报的字段保持原值
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// 任务执行结果
#[derive(Debug, Deserialize)]
pub struct TaskResultRequest {
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

impl TaskResultRequest {
    fn into_report(self) -> ApiResult<TaskReport> {
        if self.success {
            return Ok(TaskReport::success(self.payload));
        }
        match self.error {
            Some(error) if !error.trim().is_empty() => Ok(TaskReport::failure(error)),
            _ => Err(ApiError::BadRequest("失败结果必须携带 error".to_string())),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResultResponse {
    pub task: Task,
    /// 为 false 表示任务早已结束，本次结果被忽略
    pub applied: bool,
}

/// 设备连接到服务器
pub async fn device_connected(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<DeviceConnectedRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .controller
        .device_connected(&device_id, &request.attributes)
        .await?;
    Ok(success(outcome))
}

/// 设备会话结束
pub async fn device_disconnected(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.controller.device_disconnected(&device_id).await?;
    Ok(ApiResponse::success_empty_with_message(format!(
        "设备 {device_id} 已离线"
    )))
}

/// 领取设备的下一个任务，没有任务时返回 204
pub async fn deliver_next_task(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<Response> {
    match state.controller.deliver_next_task(&device_id).await? {
        Some(task) => Ok(success(task).into_response()),
        None => Ok(no_content().into_response()),
    }
}

/// 回报任务结果
pub async fn report_task_result(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(request): Json<TaskResultRequest>,
) -> ApiResult<impl IntoResponse> {
    let report = request.into_report()?;
    let outcome = state.controller.report_task_result(task_id, report).await?;
    Ok(success(TaskResultResponse {
        applied: outcome.is_applied(),
        task: outcome.task().clone(),
    }))
}
