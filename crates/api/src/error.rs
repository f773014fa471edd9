use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fleet_core::FleetError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("编排引擎错误: {0}")]
    Fleet(#[from] FleetError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Fleet(err) => match err {
                FleetError::DeviceNotFound { .. } => (StatusCode::NOT_FOUND, "DEVICE_NOT_FOUND"),
                FleetError::TaskNotFound { .. } => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND"),
                FleetError::GroupNotFound { .. } => (StatusCode::NOT_FOUND, "GROUP_NOT_FOUND"),
                FleetError::WorkflowNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND")
                }
                FleetError::ExecutionNotFound { .. } => {
                    (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
                }
                FleetError::InvalidTransition { .. } => {
                    (StatusCode::CONFLICT, "INVALID_TRANSITION")
                }
                FleetError::UnknownField(_) | FleetError::InvalidRule(_) => {
                    (StatusCode::BAD_REQUEST, "INVALID_RULE")
                }
                FleetError::InvalidCron { .. } => {
                    (StatusCode::BAD_REQUEST, "INVALID_CRON_EXPRESSION")
                }
                FleetError::CircularDependency | FleetError::InvalidDependency { .. } => {
                    (StatusCode::BAD_REQUEST, "INVALID_DEPENDENCY")
                }
                FleetError::FirmwarePathNotFound { .. } | FleetError::FirmwareNotFound { .. } => {
                    (StatusCode::BAD_REQUEST, "FIRMWARE_UNAVAILABLE")
                }
                FleetError::Network(_) | FleetError::Timeout(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE")
                }
                err if err.is_configuration_error() => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let message = match &self {
            ApiError::Fleet(err) => err.to_string(),
            other => other.to_string(),
        };
        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
