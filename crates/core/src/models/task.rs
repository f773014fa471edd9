use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 设备远程操作任务
///
/// 任务由运维人员或工作流调度器创建，只由任务状态机修改；终态任务作为审计历史保留，
/// 不会被物理删除。
///
/// # 状态流转
///
/// ```text
/// PENDING ──> SENT ──> COMPLETED
///    │          │ └──> FAILED
///    │          └────> PENDING   (超时且未超过最大重发次数)
///    └──────────┴────> CANCELLED (运维操作)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub device_id: String,
    pub kind: TaskKind,
    /// 与任务类型相关的不透明参数
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub resend_count: i32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// 发起人，`None` 表示系统发起
    pub initiated_by: Option<String>,
    pub workflow_id: Option<i64>,
    pub execution_id: Option<i64>,
    pub sent_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    FetchParameters,
    SetParameters,
    Reboot,
    FactoryReset,
    DownloadFirmware,
    UploadDiagnostic,
}

text_enum!(TaskKind, "任务类型" {
    FetchParameters => "FETCH_PARAMETERS",
    SetParameters => "SET_PARAMETERS",
    Reboot => "REBOOT",
    FactoryReset => "FACTORY_RESET",
    DownloadFirmware => "DOWNLOAD_FIRMWARE",
    UploadDiagnostic => "UPLOAD_DIAGNOSTIC",
});

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::FetchParameters,
        TaskKind::SetParameters,
        TaskKind::Reboot,
        TaskKind::FactoryReset,
        TaskKind::DownloadFirmware,
        TaskKind::UploadDiagnostic,
    ];

    /// 修改同一目标的任务共享冲突键，同一设备同一冲突键最多一个 SENT 任务
    pub fn conflict_key(&self) -> Option<&'static str> {
        match self {
            TaskKind::SetParameters => Some("parameters"),
            TaskKind::Reboot | TaskKind::FactoryReset => Some("power"),
            TaskKind::DownloadFirmware => Some("firmware"),
            TaskKind::FetchParameters | TaskKind::UploadDiagnostic => None,
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.conflict_key().is_some()
    }

    /// 与本类型共享冲突键的全部类型（含自身），无冲突键时为空
    pub fn conflicting_kinds(&self) -> Vec<TaskKind> {
        match self.conflict_key() {
            Some(key) => TaskKind::ALL
                .into_iter()
                .filter(|k| k.conflict_key() == Some(key))
                .collect(),
            None => Vec::new(),
        }
    }

    /// 校验任务参数
    pub fn validate_payload(&self, payload: &serde_json::Value) -> crate::FleetResult<()> {
        match self {
            TaskKind::SetParameters => {
                let values = payload
                    .get("values")
                    .and_then(|v| v.as_object())
                    .ok_or_else(|| {
                        crate::FleetError::invalid_payload("SET_PARAMETERS 需要 values 对象")
                    })?;
                if values.is_empty() {
                    return Err(crate::FleetError::invalid_payload(
                        "SET_PARAMETERS 的 values 不能为空",
                    ));
                }
            }
            TaskKind::FetchParameters => {
                if let Some(names) = payload.get("names") {
                    if !names.is_array() {
                        return Err(crate::FleetError::invalid_payload(
                            "FETCH_PARAMETERS 的 names 必须是数组",
                        ));
                    }
                }
            }
            TaskKind::DownloadFirmware => {
                if let Some(version) = payload.get("target_version") {
                    if !version.is_string() {
                        return Err(crate::FleetError::invalid_payload(
                            "DOWNLOAD_FIRMWARE 的 target_version 必须是字符串",
                        ));
                    }
                }
            }
            TaskKind::Reboot | TaskKind::FactoryReset | TaskKind::UploadDiagnostic => {}
        }
        Ok(())
    }
}

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Sent,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(TaskStatus, "任务状态" {
    Pending => "PENDING",
    Sent => "SENT",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Sent)
                | (Pending, Cancelled)
                | (Sent, Completed)
                | (Sent, Failed)
                | (Sent, Pending)
                | (Sent, Cancelled)
        )
    }
}

/// 任务状态机发布给调度器的事件
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// 任务已下发到设备
    Sent(Task),
    /// 任务到达终态
    Terminal(Task),
}

impl TaskEvent {
    pub fn task(&self) -> &Task {
        match self {
            TaskEvent::Sent(task) | TaskEvent::Terminal(task) => task,
        }
    }
}

impl Task {
    /// 创建新任务
    pub fn new(device_id: impl Into<String>, kind: TaskKind, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            device_id: device_id.into(),
            kind,
            payload,
            status: TaskStatus::Pending,
            resend_count: 0,
            result: None,
            error: None,
            initiated_by: None,
            workflow_id: None,
            execution_id: None,
            sent_at: None,
            deadline_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_initiator(mut self, initiated_by: impl Into<String>) -> Self {
        self.initiated_by = Some(initiated_by.into());
        self
    }

    pub fn for_execution(mut self, workflow_id: i64, execution_id: i64) -> Self {
        self.workflow_id = Some(workflow_id);
        self.execution_id = Some(execution_id);
        self
    }

    pub fn is_system_initiated(&self) -> bool {
        self.initiated_by.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Sent && self.deadline_at.is_some_and(|deadline| deadline <= now)
    }
}
