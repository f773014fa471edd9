use thiserror::Error;

/// 编排引擎错误类型定义
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),

    #[error("设备未找到: {id}")]
    DeviceNotFound { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("设备分组未找到: {id}")]
    GroupNotFound { id: i64 },

    #[error("工作流未找到: {id}")]
    WorkflowNotFound { id: i64 },

    #[error("执行记录未找到: {id}")]
    ExecutionNotFound { id: i64 },

    #[error("无效的状态转换: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("未知的规则字段: {0}")]
    UnknownField(String),

    #[error("无效的规则: {0}")]
    InvalidRule(String),

    #[error("无法解析固件升级路径: 设备类型 {device_type} 从 {from} 到 {to}")]
    FirmwarePathNotFound {
        device_type: String,
        from: String,
        to: String,
    },

    #[error("固件镜像未找到: 设备类型 {device_type} 版本 {version}")]
    FirmwareNotFound {
        device_type: String,
        version: String,
    },

    #[error("检测到循环依赖")]
    CircularDependency,

    #[error("无效的工作流依赖: 工作流 {workflow_id} 依赖工作流 {dependency_id} - {reason}")]
    InvalidDependency {
        workflow_id: i64,
        dependency_id: i64,
        reason: String,
    },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的任务参数: {0}")]
    InvalidTaskPayload(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }

    pub fn device_not_found<S: Into<String>>(id: S) -> Self {
        Self::DeviceNotFound { id: id.into() }
    }

    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskPayload(msg.into())
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidTransition {
            entity: entity.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// 配置类错误：重试无法成功，需要运维人员修正
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            FleetError::UnknownField(_)
                | FleetError::InvalidRule(_)
                | FleetError::FirmwarePathNotFound { .. }
                | FleetError::FirmwareNotFound { .. }
                | FleetError::CircularDependency
                | FleetError::InvalidDependency { .. }
                | FleetError::InvalidCron { .. }
                | FleetError::InvalidTaskPayload(_)
                | FleetError::Configuration(_)
                | FleetError::ValidationError(_)
        )
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_path_error_is_configuration_error() {
        let err = FleetError::FirmwarePathNotFound {
            device_type: "hgw".to_string(),
            from: "1.0".to_string(),
            to: "3.0".to_string(),
        };
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_network_error_is_not_configuration_error() {
        let err = FleetError::Network("connection refused".to_string());
        assert!(!err.is_configuration_error());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = FleetError::invalid_transition("task", "COMPLETED", "SENT");
        assert_eq!(err.to_string(), "无效的状态转换: task COMPLETED -> SENT");
    }
}
