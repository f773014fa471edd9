use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskKind;

/// 批量设备工作流
///
/// 工作流属于一个设备分组，对每个匹配设备应用同一种任务。
///
/// # 字段说明
///
/// - `schedule_mode`: 调度方式；`SCHEDULED` 需要 `scheduled_at`，`RECURRING` 需要 `cron_expression`
/// - `rate_limit`: 每小时最多创建的任务数，0 表示不限
/// - `max_concurrent`: 同时在途的执行数，0 表示不限
/// - `retry_count`: 单台设备的最大尝试次数，`attempts < retry_count` 时失败才会重试
/// - `stop_on_failure_percent`: 失败率达到该百分比时自动暂停，0 表示关闭熔断
/// - `depends_on_workflow_id`: 前置工作流；设备只有在前置工作流对该设备成功后才会被调度
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: i64,
    pub name: String,
    pub group_id: i64,
    pub task_kind: TaskKind,
    pub parameters: serde_json::Value,
    pub schedule_mode: ScheduleMode,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub cron_expression: Option<String>,
    pub rate_limit: u32,
    pub max_concurrent: u32,
    pub retry_count: u32,
    pub retry_delay_minutes: u32,
    pub stop_on_failure_percent: u32,
    pub depends_on_workflow_id: Option<i64>,
    pub run_once_per_device: bool,
    pub status: WorkflowStatus,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 调度方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleMode {
    Immediate,
    Scheduled,
    Recurring,
    OnConnect,
}

text_enum!(ScheduleMode, "调度方式" {
    Immediate => "IMMEDIATE",
    Scheduled => "SCHEDULED",
    Recurring => "RECURRING",
    OnConnect => "ON_CONNECT",
});

/// 工作流状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

text_enum!(WorkflowStatus, "工作流状态" {
    Draft => "DRAFT",
    Active => "ACTIVE",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Cancelled)
                | (Active, Paused)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Paused, Active)
                | (Paused, Cancelled)
        )
    }
}

/// 工作流进度，由执行记录派生
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowProgress {
    pub workflow_id: i64,
    pub status: Option<WorkflowStatus>,
    pub total: u64,
    pub pending: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
    /// `failed / (failed + completed)`，没有终态结果时为 0
    pub failure_ratio: f64,
}

impl Workflow {
    /// 创建草稿状态的工作流
    pub fn new(
        name: impl Into<String>,
        group_id: i64,
        task_kind: TaskKind,
        parameters: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            name: name.into(),
            group_id,
            task_kind,
            parameters,
            schedule_mode: ScheduleMode::Immediate,
            scheduled_at: None,
            cron_expression: None,
            rate_limit: 0,
            max_concurrent: 0,
            retry_count: 0,
            retry_delay_minutes: 0,
            stop_on_failure_percent: 0,
            depends_on_workflow_id: None,
            run_once_per_device: true,
            status: WorkflowStatus::Draft,
            activated_at: None,
            last_fired_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// 只有一次性工作流会在所有执行结束后自动完成
    pub fn completes_when_settled(&self) -> bool {
        matches!(
            self.schedule_mode,
            ScheduleMode::Immediate | ScheduleMode::Scheduled
        )
    }

    pub fn has_dependency(&self) -> bool {
        self.depends_on_workflow_id.is_some()
    }
}
