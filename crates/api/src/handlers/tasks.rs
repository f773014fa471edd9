use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use fleet_core::TaskKind;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

/// 运维人员下发的任务
#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub kind: TaskKind,
    #[serde(default = "empty_object")]
    pub payload: Value,
    pub operator: String,
}

#[derive(Debug, Deserialize)]
pub struct OperatorQuery {
    pub operator: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// 对设备直接创建任务，设备不在线时会尝试唤醒
pub async fn create_device_task(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.operator.trim().is_empty() {
        return Err(ApiError::BadRequest("operator 不能为空".to_string()));
    }
    let task = state
        .controller
        .create_task(&device_id, request.kind, request.payload, &request.operator)
        .await?;
    Ok(created(task))
}

/// 设备的任务历史，最新的在前
pub async fn list_device_tasks(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.device_tasks(&device_id).await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.get_task(task_id).await?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.cancel_task(task_id).await?))
}

/// 重试失败的任务，返回新建的任务
pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Query(query): Query<OperatorQuery>,
) -> ApiResult<impl IntoResponse> {
    let operator = query.operator.unwrap_or_else(|| "console".to_string());
    let task = state.controller.retry_task(task_id, &operator).await?;
    Ok(created(task))
}
