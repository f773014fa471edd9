use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fleet_config::TaskTimeoutConfig;
use fleet_core::{
    traits::{DeviceRepository, TaskRepository, WorkflowRepository},
    FleetError, FleetResult, StructuredLogger, Task, TaskEvent, TaskStatus, WorkflowStatus,
};

/// 条件更新冲突时的最大重读次数
const MAX_CAS_ATTEMPTS: usize = 5;

/// 设备上报结果的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// 结果已应用，任务进入终态
    Applied(Task),
    /// 任务早已处于终态，结果被忽略
    Ignored(Task),
}

impl ReportOutcome {
    pub fn task(&self) -> &Task {
        match self {
            ReportOutcome::Applied(task) | ReportOutcome::Ignored(task) => task,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ReportOutcome::Applied(_))
    }
}

/// 一次超时扫描的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    pub failed: usize,
}

/// 设备上报的任务结果
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

impl TaskReport {
    pub fn success(payload: Option<Value>) -> Self {
        Self {
            success: true,
            payload,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// 任务状态机
///
/// 任务的所有状态变化都经过这里。每次变化都是对仓储的条件更新，
/// 多个进程同时处理同一任务时只有一个能成功。
pub struct TaskStateMachine {
    task_repo: Arc<dyn TaskRepository>,
    device_repo: Arc<dyn DeviceRepository>,
    workflow_repo: Arc<dyn WorkflowRepository>,
    timeouts: TaskTimeoutConfig,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl TaskStateMachine {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        device_repo: Arc<dyn DeviceRepository>,
        workflow_repo: Arc<dyn WorkflowRepository>,
        timeouts: TaskTimeoutConfig,
    ) -> Self {
        Self {
            task_repo,
            device_repo,
            workflow_repo,
            timeouts,
            events: None,
        }
    }

    /// 将任务事件发布到调度器的状态监听器
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn timeouts(&self) -> &TaskTimeoutConfig {
        &self.timeouts
    }

    /// 创建待下发任务
    pub async fn create_task(&self, task: Task) -> FleetResult<Task> {
        task.kind.validate_payload(&task.payload)?;

        if self.device_repo.get(&task.device_id).await?.is_none() {
            return Err(FleetError::device_not_found(&task.device_id));
        }

        let mut task = task;
        let now = Utc::now();
        task.status = TaskStatus::Pending;
        task.resend_count = 0;
        task.sent_at = None;
        task.deadline_at = None;
        task.completed_at = None;
        task.created_at = now;
        task.updated_at = now;

        let created = self.task_repo.create(&task).await?;
        StructuredLogger::log_task_created(
            created.id,
            &created.device_id,
            created.kind,
            created.initiated_by.as_deref(),
        );
        Ok(created)
    }

    pub async fn get_task(&self, task_id: i64) -> FleetResult<Task> {
        self.task_repo
            .get(task_id)
            .await?
            .ok_or(FleetError::TaskNotFound { id: task_id })
    }

    /// 设备在线时选出下一个可下发的任务并标记为已下发
    ///
    /// 按创建顺序选择第一个冲突键上没有已下发任务的待下发任务。所属工作流
    /// 不处于 ACTIVE 的任务保持待下发，工作流恢复后再下发。冲突键由仓储在
    /// 认领写入时再次检查。
    pub async fn deliver_next_task(&self, device_id: &str) -> FleetResult<Option<Task>> {
        let mut workflow_active: HashMap<i64, bool> = HashMap::new();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let busy: HashSet<&'static str> = self
                .task_repo
                .sent_for_device(device_id)
                .await?
                .iter()
                .filter_map(|task| task.kind.conflict_key())
                .collect();

            let mut candidate = None;
            for task in self.task_repo.pending_for_device(device_id).await? {
                if task.kind.conflict_key().is_some_and(|key| busy.contains(key)) {
                    continue;
                }
                if let Some(workflow_id) = task.workflow_id {
                    if !self.workflow_is_active(workflow_id, &mut workflow_active).await? {
                        continue;
                    }
                }
                candidate = Some(task);
                break;
            }

            let Some(task) = candidate else {
                debug!("设备 {} 没有可下发的任务", device_id);
                return Ok(None);
            };

            let now = Utc::now();
            let mut sent = task.clone();
            sent.status = TaskStatus::Sent;
            sent.sent_at = Some(now);
            sent.deadline_at = Some(now + self.timeout_for(&task));
            sent.updated_at = now;

            if self.task_repo.claim_for_delivery(&sent).await? {
                StructuredLogger::log_task_transition(
                    sent.id,
                    &sent.device_id,
                    TaskStatus::Pending,
                    TaskStatus::Sent,
                    sent.resend_count,
                );
                self.publish(TaskEvent::Sent(sent.clone()));
                return Ok(Some(sent));
            }

            debug!("任务 {} 已被其他参与者处理或冲突键被占用，重新选择", task.id);
        }

        warn!("设备 {} 的任务下发竞争过于激烈，本次放弃", device_id);
        Ok(None)
    }

    /// 应用设备上报的任务结果
    ///
    /// 已超时退回待下发的任务同样接受结果，因为设备实际执行了它。
    pub async fn report_result(&self, task_id: i64, report: TaskReport) -> FleetResult<ReportOutcome> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let task = self.get_task(task_id).await?;
            if task.is_terminal() {
                StructuredLogger::log_late_result_ignored(task.id, task.status);
                return Ok(ReportOutcome::Ignored(task));
            }
            if task.status == TaskStatus::Pending && task.resend_count == 0 {
                // 从未下发过的任务不可能有结果
                return Err(FleetError::invalid_transition(
                    "task",
                    task.status,
                    if report.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    },
                ));
            }

            let now = Utc::now();
            let expected = task.status;
            let mut finished = task;
            finished.status = if report.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            finished.result = report.payload.clone();
            finished.error = if report.success {
                None
            } else {
                Some(
                    report
                        .error
                        .clone()
                        .unwrap_or_else(|| "设备未提供错误信息".to_string()),
                )
            };
            finished.completed_at = Some(now);
            finished.updated_at = now;

            if self.task_repo.compare_and_set(&finished, expected).await? {
                if expected == TaskStatus::Pending {
                    info!("任务 {} 在重新下发前收到了设备的迟到结果", finished.id);
                }
                if let Some(error) = &finished.error {
                    warn!(
                        "设备 {} 上的 {} 任务 {} 执行失败: {}",
                        finished.device_id, finished.kind, finished.id, error
                    );
                }
                StructuredLogger::log_task_transition(
                    finished.id,
                    &finished.device_id,
                    expected,
                    finished.status,
                    finished.resend_count,
                );
                self.publish(TaskEvent::Terminal(finished.clone()));
                return Ok(ReportOutcome::Applied(finished));
            }
        }

        Err(FleetError::Internal(format!(
            "任务 {task_id} 的结果写入多次冲突"
        )))
    }

    /// 取消待下发或已下发的任务
    ///
    /// 已下发任务的取消只是尽力而为，设备可能已经开始执行。
    pub async fn cancel_task(&self, task_id: i64) -> FleetResult<Task> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let task = self.get_task(task_id).await?;
            if !task.status.can_transition_to(TaskStatus::Cancelled) {
                return Err(FleetError::invalid_transition(
                    "task",
                    task.status,
                    TaskStatus::Cancelled,
                ));
            }

            let now = Utc::now();
            let expected = task.status;
            let mut cancelled = task;
            cancelled.status = TaskStatus::Cancelled;
            cancelled.completed_at = Some(now);
            cancelled.updated_at = now;

            if self.task_repo.compare_and_set(&cancelled, expected).await? {
                if expected == TaskStatus::Sent {
                    warn!("任务 {} 已下发到设备，取消仅对服务端生效", cancelled.id);
                }
                StructuredLogger::log_task_transition(
                    cancelled.id,
                    &cancelled.device_id,
                    expected,
                    TaskStatus::Cancelled,
                    cancelled.resend_count,
                );
                self.publish(TaskEvent::Terminal(cancelled.clone()));
                return Ok(cancelled);
            }
        }

        Err(FleetError::Internal(format!("任务 {task_id} 的取消多次冲突")))
    }

    /// 基于失败或已取消的任务创建新任务，原任务保留为历史记录
    pub async fn retry_task(&self, task_id: i64, operator: &str) -> FleetResult<Task> {
        let original = self.get_task(task_id).await?;
        if !matches!(original.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(FleetError::invalid_transition(
                "task",
                original.status,
                TaskStatus::Pending,
            ));
        }

        let retry = Task::new(original.device_id.clone(), original.kind, original.payload.clone())
            .with_initiator(operator);
        let created = self.create_task(retry).await?;
        info!("任务 {} 已由 {} 重试，新任务 {}", task_id, operator, created.id);
        Ok(created)
    }

    /// 处理超过截止时间的已下发任务
    ///
    /// 第 k 次超时且 k 小于最大重发次数时退回待下发，否则永久失败。
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> FleetResult<SweepReport> {
        let mut report = SweepReport::default();

        for task in self.task_repo.expired_sent(now).await? {
            let Some(deadline_at) = task.deadline_at else {
                continue;
            };

            let mut next = task.clone();
            next.resend_count += 1;
            next.updated_at = now;
            let exhausted = next.resend_count >= self.timeouts.max_resends as i32;
            if exhausted {
                next.status = TaskStatus::Failed;
                next.error = Some(format!("任务超时，已重发 {} 次", task.resend_count));
                next.completed_at = Some(now);
            } else {
                next.status = TaskStatus::Pending;
                next.sent_at = None;
                next.deadline_at = None;
            }

            if !self.task_repo.compare_and_set(&next, TaskStatus::Sent).await? {
                debug!("任务 {} 在超时处理前已被更新，跳过", task.id);
                continue;
            }

            StructuredLogger::log_task_timeout(
                next.id,
                &next.device_id,
                deadline_at,
                next.resend_count,
                exhausted,
            );

            if exhausted {
                report.failed += 1;
                self.publish(TaskEvent::Terminal(next));
            } else {
                report.resent += 1;
            }
        }

        if report.resent + report.failed > 0 {
            info!(
                "超时扫描完成: {} 个任务退回待下发, {} 个任务失败",
                report.resent, report.failed
            );
        }
        Ok(report)
    }

    async fn workflow_is_active(
        &self,
        workflow_id: i64,
        cache: &mut HashMap<i64, bool>,
    ) -> FleetResult<bool> {
        if let Some(active) = cache.get(&workflow_id) {
            return Ok(*active);
        }
        let active = self
            .workflow_repo
            .get(workflow_id)
            .await?
            .is_some_and(|w| w.status == WorkflowStatus::Active);
        if !active {
            debug!("工作流 {} 未处于运行状态，暂缓下发其任务", workflow_id);
        }
        cache.insert(workflow_id, active);
        Ok(active)
    }

    fn timeout_for(&self, task: &Task) -> chrono::Duration {
        chrono::Duration::from_std(self.timeouts.timeout_for(task.kind))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
    }

    fn publish(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                warn!("任务事件通道已关闭，事件被丢弃");
            }
        }
    }
}
