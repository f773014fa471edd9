//! 结构化日志事件
//!
//! 所有关键状态变化都通过这里输出，保证字段名称一致，便于按 `event` 字段检索。

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::models::{ExecutionStatus, TaskKind, TaskStatus, WakeStrategyKind};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_created(task_id: i64, device_id: &str, kind: TaskKind, initiated_by: Option<&str>) {
        info!(
            event = "task_created",
            task.id = task_id,
            device.id = device_id,
            task.kind = %kind,
            task.initiated_by = initiated_by.unwrap_or("system"),
            "任务已创建"
        );
    }

    pub fn log_task_transition(
        task_id: i64,
        device_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        resend_count: i32,
    ) {
        info!(
            event = "task_transition",
            task.id = task_id,
            device.id = device_id,
            task.from = %from,
            task.to = %to,
            task.resend_count = resend_count,
            "任务状态变更"
        );
    }

    pub fn log_task_timeout(
        task_id: i64,
        device_id: &str,
        deadline_at: DateTime<Utc>,
        resend_count: i32,
        exhausted: bool,
    ) {
        if exhausted {
            error!(
                event = "task_timeout",
                task.id = task_id,
                device.id = device_id,
                task.deadline_at = %deadline_at,
                task.resend_count = resend_count,
                "任务超时且已达到最大重发次数，标记为失败"
            );
        } else {
            warn!(
                event = "task_timeout",
                task.id = task_id,
                device.id = device_id,
                task.deadline_at = %deadline_at,
                task.resend_count = resend_count,
                "任务超时，等待设备下次连接时重新下发"
            );
        }
    }

    pub fn log_late_result_ignored(task_id: i64, status: TaskStatus) {
        warn!(
            event = "late_result_ignored",
            task.id = task_id,
            task.status = %status,
            "任务已处于终态，忽略设备上报的结果"
        );
    }

    pub fn log_execution_transition(
        execution_id: i64,
        workflow_id: i64,
        device_id: &str,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) {
        debug!(
            event = "execution_transition",
            execution.id = execution_id,
            workflow.id = workflow_id,
            device.id = device_id,
            execution.from = %from,
            execution.to = %to,
            "执行记录状态变更"
        );
    }

    pub fn log_workflow_paused(workflow_id: i64, failed: u64, completed: u64, threshold_percent: u32) {
        error!(
            event = "workflow_paused",
            workflow.id = workflow_id,
            workflow.failed = failed,
            workflow.completed = completed,
            workflow.threshold_percent = threshold_percent,
            "失败率超过阈值，工作流已自动暂停"
        );
    }

    pub fn log_workflow_completed(workflow_id: i64, total: u64) {
        info!(
            event = "workflow_completed",
            workflow.id = workflow_id,
            workflow.total = total,
            "工作流所有执行记录均已结束"
        );
    }

    pub fn log_wake_attempt(
        device_id: &str,
        strategy: WakeStrategyKind,
        success: bool,
        error_message: Option<&str>,
    ) {
        if success {
            info!(
                event = "wake_attempt",
                device.id = device_id,
                wake.strategy = %strategy,
                wake.success = true,
                "唤醒请求已送达"
            );
        } else {
            warn!(
                event = "wake_attempt",
                device.id = device_id,
                wake.strategy = %strategy,
                wake.success = false,
                wake.error = error_message.unwrap_or(""),
                "唤醒请求失败，尝试下一种策略"
            );
        }
    }

    pub fn log_membership_changed(device_id: &str, joined: &[i64], left: &[i64]) {
        debug!(
            event = "membership_changed",
            device.id = device_id,
            membership.joined = ?joined,
            membership.left = ?left,
            "设备分组成员关系变化"
        );
    }

    pub fn log_configuration_error(workflow_id: i64, device_id: &str, message: &str) {
        error!(
            event = "configuration_error",
            workflow.id = workflow_id,
            device.id = device_id,
            error = message,
            "配置错误，执行记录标记为失败且不再重试"
        );
    }
}
