use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 工作流在单个设备上的执行记录
///
/// 每个 (workflow_id, device_id) 组合最多一条记录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: i64,
    pub workflow_id: i64,
    pub device_id: String,
    pub status: ExecutionStatus,
    /// 最近一次产生的任务
    pub task_id: Option<i64>,
    /// 已准入的尝试次数
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 结果快照
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// 执行记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

text_enum!(ExecutionStatus, "执行状态" {
    Pending => "PENDING",
    Queued => "QUEUED",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Skipped => "SKIPPED",
    Cancelled => "CANCELLED",
});

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 7] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Queued,
        ExecutionStatus::InProgress,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Skipped,
        ExecutionStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::Cancelled
        )
    }

    /// 计入并发上限的在途状态
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ExecutionStatus::Queued | ExecutionStatus::InProgress)
    }
}

/// 按状态统计的执行记录数量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionStats {
    pub pending: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

impl ExecutionStats {
    pub fn add(&mut self, status: ExecutionStatus, count: u64) {
        match status {
            ExecutionStatus::Pending => self.pending += count,
            ExecutionStatus::Queued => self.queued += count,
            ExecutionStatus::InProgress => self.in_progress += count,
            ExecutionStatus::Completed => self.completed += count,
            ExecutionStatus::Failed => self.failed += count,
            ExecutionStatus::Skipped => self.skipped += count,
            ExecutionStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending
            + self.queued
            + self.in_progress
            + self.completed
            + self.failed
            + self.skipped
            + self.cancelled
    }

    pub fn in_flight(&self) -> u64 {
        self.queued + self.in_progress
    }

    /// 失败率：`failed / (failed + completed)`
    pub fn failure_ratio(&self) -> f64 {
        let decided = self.failed + self.completed;
        if decided == 0 {
            0.0
        } else {
            self.failed as f64 / decided as f64
        }
    }
}

impl Execution {
    pub fn new(workflow_id: i64, device_id: impl Into<String>, status: ExecutionStatus) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            workflow_id,
            device_id: device_id.into(),
            status,
            task_id: None,
            attempts: 0,
            next_retry_at: None,
            result: None,
            scheduled_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 是否已到达重试时间
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}
