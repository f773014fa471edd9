use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use fleet_config::SchedulerConfig;
use fleet_core::{
    traits::{DeviceRepository, ExecutionRepository, TaskRepository, WorkflowRepository},
    Device, Execution, ExecutionStatus, FleetError, FleetResult, ScheduleMode, StructuredLogger,
    Task, TaskEvent, TaskKind, TaskStatus, Workflow, WorkflowProgress, WorkflowStatus,
};

use crate::connection_dispatcher::ConnectionDispatcher;
use crate::cron_utils::CronScheduler;
use crate::dependency_checker::{DependencyCheckService, DependencyChecker};
use crate::firmware_resolver::FirmwarePathResolver;
use crate::membership_index::MembershipIndex;
use crate::retry_policy::{RetryDecision, RetryPolicy};
use crate::task_state_machine::TaskStateMachine;

/// `rate_limit` 的滚动窗口
const RATE_WINDOW_MINUTES: i64 = 60;

/// 调度器触发事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerTrigger {
    /// 周期性时钟
    Tick,
    /// 工作流被激活或恢复
    WorkflowActivated(i64),
    /// 设备连接到服务器
    DeviceConnected {
        device_id: String,
        /// 设备此前处于离线状态
        newly_online: bool,
        /// 本次属性变化后新加入的分组
        joined_groups: Vec<i64>,
    },
    /// 前置工作流上某台设备的执行已成功
    PredecessorSettled { workflow_id: i64, device_id: String },
}

/// 调度器使用的仓储集合
#[derive(Clone)]
pub struct SchedulerRepositories {
    pub devices: Arc<dyn DeviceRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
}

struct ConnectContext<'a> {
    device: &'a Device,
    newly_online: bool,
    joined_groups: &'a [i64],
}

/// 一次触发需要处理的设备集合
struct Firing {
    targets: Vec<String>,
    rearm: bool,
}

enum Work {
    Task(Task),
    /// 设备已处于目标状态，无需下发任务
    AlreadyDone(Value),
}

enum AdmitOutcome {
    Queued,
    Completed,
    Failed,
    Deferred,
}

/// 工作流调度器
///
/// 每个工作流的准入决策通过独立的异步锁串行化，不同工作流之间并行。
/// 跨进程的竞争由仓储的条件更新保证。
pub struct WorkflowScheduler {
    repos: SchedulerRepositories,
    membership: Arc<MembershipIndex>,
    resolver: Arc<FirmwarePathResolver>,
    tasks: Arc<TaskStateMachine>,
    dependencies: DependencyChecker,
    dispatcher: Option<Arc<ConnectionDispatcher>>,
    config: SchedulerConfig,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl WorkflowScheduler {
    pub fn new(
        repos: SchedulerRepositories,
        membership: Arc<MembershipIndex>,
        resolver: Arc<FirmwarePathResolver>,
        tasks: Arc<TaskStateMachine>,
        config: SchedulerConfig,
    ) -> Self {
        let dependencies =
            DependencyChecker::new(repos.workflows.clone(), repos.executions.clone());
        Self {
            repos,
            membership,
            resolver,
            tasks,
            dependencies,
            dispatcher: None,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 任务入队后通过该分发器唤醒设备
    pub fn with_dispatcher(mut self, dispatcher: Arc<ConnectionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 处理一次触发，返回本次准入的执行数量
    pub async fn handle(&self, trigger: SchedulerTrigger) -> FleetResult<usize> {
        let now = Utc::now();
        let mut settled = Vec::new();
        let mut admitted = 0;

        match trigger {
            SchedulerTrigger::Tick => {
                for workflow in self.repos.workflows.list_by_status(WorkflowStatus::Active).await? {
                    match self.process_workflow(workflow.id, now, None, &mut settled).await {
                        Ok(count) => admitted += count,
                        Err(e) => error!("调度工作流 {} 时出错: {}", workflow.id, e),
                    }
                }
            }
            SchedulerTrigger::WorkflowActivated(workflow_id) => {
                admitted += self
                    .process_workflow(workflow_id, now, None, &mut settled)
                    .await?;
            }
            SchedulerTrigger::DeviceConnected {
                device_id,
                newly_online,
                joined_groups,
            } => {
                let device = self
                    .repos
                    .devices
                    .get(&device_id)
                    .await?
                    .ok_or_else(|| FleetError::device_not_found(&device_id))?;
                self.continue_firmware_upgrades(&device, now, &mut settled)
                    .await?;

                let context = ConnectContext {
                    device: &device,
                    newly_online,
                    joined_groups: &joined_groups,
                };
                for workflow in self.repos.workflows.list_by_status(WorkflowStatus::Active).await? {
                    match self
                        .process_workflow(workflow.id, now, Some(&context), &mut settled)
                        .await
                    {
                        Ok(count) => admitted += count,
                        Err(e) => error!(
                            "设备 {} 连接时调度工作流 {} 出错: {}",
                            device_id, workflow.id, e
                        ),
                    }
                }
            }
            SchedulerTrigger::PredecessorSettled {
                workflow_id,
                device_id,
            } => {
                debug!("前置工作流 {} 在设备 {} 上已成功", workflow_id, device_id);
                settled.push(workflow_id);
            }
        }

        admitted += self.propagate(settled, now).await?;
        Ok(admitted)
    }

    /// 应用任务状态机发布的事件
    pub async fn on_task_event(&self, event: TaskEvent) -> FleetResult<()> {
        let task = event.task();
        let (Some(workflow_id), Some(execution_id)) = (task.workflow_id, task.execution_id) else {
            return Ok(());
        };
        let now = Utc::now();
        let mut settled = Vec::new();

        {
            let lock = self.workflow_lock(workflow_id).await;
            let _guard = lock.lock().await;

            let Some(workflow) = self.repos.workflows.get(workflow_id).await? else {
                warn!("任务 {} 引用的工作流 {} 不存在", task.id, workflow_id);
                return Ok(());
            };
            let Some(execution) = self.repos.executions.get(execution_id).await? else {
                warn!("任务 {} 引用的执行记录 {} 不存在", task.id, execution_id);
                return Ok(());
            };

            match &event {
                TaskEvent::Sent(task) => {
                    if execution.status == ExecutionStatus::Queued {
                        let mut next = execution.clone();
                        next.status = ExecutionStatus::InProgress;
                        next.task_id = Some(task.id);
                        next.updated_at = now;
                        self.save_execution(&next, ExecutionStatus::Queued).await?;
                    }
                }
                TaskEvent::Terminal(task) => {
                    self.apply_task_outcome(&workflow, execution, task, now, &mut settled)
                        .await?;
                    if self.evaluate_workflow_state(workflow_id).await? {
                        self.admit_pending(&workflow, now, None, &mut settled)
                            .await?;
                    }
                }
            }
        }

        self.propagate(settled, now).await?;
        Ok(())
    }

    /// 工作流进度，由执行记录派生
    pub async fn progress(&self, workflow_id: i64) -> FleetResult<WorkflowProgress> {
        let workflow = self
            .repos
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(FleetError::WorkflowNotFound { id: workflow_id })?;
        let stats = self.repos.executions.stats(workflow_id).await?;

        Ok(WorkflowProgress {
            workflow_id,
            status: Some(workflow.status),
            total: stats.total(),
            pending: stats.pending,
            queued: stats.queued,
            in_progress: stats.in_progress,
            completed: stats.completed,
            failed: stats.failed,
            skipped: stats.skipped,
            cancelled: stats.cancelled,
            failure_ratio: stats.failure_ratio(),
        })
    }

    /// 取消工作流所有未结束的执行记录
    ///
    /// 未结束的任务一并取消。已下发任务的取消只对服务端生效，设备可能仍在执行，
    /// 其结果到达时会被忽略，超时扫描也不会再重发它。
    pub async fn cancel_open_executions(&self, workflow_id: i64) -> FleetResult<usize> {
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;
        let now = Utc::now();
        let mut cancelled = 0;

        for execution in self.repos.executions.list_for_workflow(workflow_id).await? {
            if execution.is_terminal() {
                continue;
            }
            let mut next = execution.clone();
            next.status = ExecutionStatus::Cancelled;
            next.completed_at = Some(now);
            next.updated_at = now;
            if !self.save_execution(&next, execution.status).await? {
                continue;
            }
            cancelled += 1;

            if let Some(task_id) = execution.task_id {
                if let Some(task) = self.repos.tasks.get(task_id).await? {
                    if !task.is_terminal() {
                        if let Err(e) = self.tasks.cancel_task(task_id).await {
                            warn!("取消任务 {} 失败: {}", task_id, e);
                        }
                    }
                }
            }
        }

        info!("工作流 {} 已取消 {} 个执行记录", workflow_id, cancelled);
        Ok(cancelled)
    }

    async fn workflow_lock(&self, workflow_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 依次处理执行成功设备所在工作流的后继工作流
    async fn propagate(&self, mut settled: Vec<i64>, now: DateTime<Utc>) -> FleetResult<usize> {
        let mut admitted = 0;
        while !settled.is_empty() {
            let workflow_ids: BTreeSet<i64> = settled.drain(..).collect();
            for workflow_id in workflow_ids {
                for dependent in self.dependencies.dependents_of(workflow_id).await? {
                    if !dependent.is_active() {
                        continue;
                    }
                    admitted += self
                        .process_workflow(dependent.id, now, None, &mut settled)
                        .await?;
                }
            }
        }
        Ok(admitted)
    }

    async fn process_workflow(
        &self,
        workflow_id: i64,
        now: DateTime<Utc>,
        connect: Option<&ConnectContext<'_>>,
        settled: &mut Vec<i64>,
    ) -> FleetResult<usize> {
        let lock = self.workflow_lock(workflow_id).await;
        let _guard = lock.lock().await;

        let Some(mut workflow) = self.repos.workflows.get(workflow_id).await? else {
            return Ok(0);
        };
        if !workflow.is_active() {
            return Ok(0);
        }

        if let Some(firing) = self.firing(&mut workflow, now, connect).await? {
            self.ensure_executions(&workflow, &firing, now).await?;
        }
        self.release_skipped(&workflow, now).await?;

        let mut admitted = 0;
        if self.evaluate_workflow_state(workflow_id).await? {
            let connecting = connect.map(|c| c.device.id.as_str());
            admitted = self
                .admit_pending(&workflow, now, connecting, settled)
                .await?;
            self.evaluate_workflow_state(workflow_id).await?;
        }
        Ok(admitted)
    }

    /// 判断调度条件是否满足，并给出目标设备
    async fn firing(
        &self,
        workflow: &mut Workflow,
        now: DateTime<Utc>,
        connect: Option<&ConnectContext<'_>>,
    ) -> FleetResult<Option<Firing>> {
        match workflow.schedule_mode {
            ScheduleMode::Immediate | ScheduleMode::Scheduled => {
                if workflow.scheduled_at.is_some_and(|at| at > now) {
                    return Ok(None);
                }
                if workflow.last_fired_at.is_none() {
                    workflow.last_fired_at = Some(now);
                    workflow.updated_at = now;
                    self.repos.workflows.update(workflow).await?;
                    info!("工作流 {} 开始执行", workflow.id);
                }
                Ok(Some(Firing {
                    targets: self.membership.members_of(workflow.group_id).await,
                    rearm: false,
                }))
            }
            ScheduleMode::Recurring => {
                let Some(expression) = workflow.cron_expression.as_deref() else {
                    warn!("周期工作流 {} 缺少CRON表达式", workflow.id);
                    return Ok(None);
                };
                let cron = match CronScheduler::new(expression) {
                    Ok(cron) => cron,
                    Err(e) => {
                        error!("工作流 {} 的CRON表达式无效: {}", workflow.id, e);
                        return Ok(None);
                    }
                };
                let since = workflow
                    .last_fired_at
                    .or(workflow.activated_at)
                    .unwrap_or(workflow.created_at);
                let Some(occurrence) = cron.latest_due(since, now) else {
                    return Ok(None);
                };

                workflow.last_fired_at = Some(occurrence);
                workflow.updated_at = now;
                self.repos.workflows.update(workflow).await?;
                info!(
                    "周期工作流 {} 触发，触发时间 {}",
                    workflow.id,
                    occurrence.format("%Y-%m-%d %H:%M:%S UTC")
                );
                Ok(Some(Firing {
                    targets: self.membership.members_of(workflow.group_id).await,
                    rearm: !workflow.run_once_per_device,
                }))
            }
            ScheduleMode::OnConnect => {
                let Some(context) = connect else {
                    return Ok(None);
                };
                if !self
                    .membership
                    .matches_now(context.device, workflow.group_id)
                    .await?
                {
                    return Ok(None);
                }
                let fresh_event =
                    context.newly_online || context.joined_groups.contains(&workflow.group_id);
                Ok(Some(Firing {
                    targets: vec![context.device.id.clone()],
                    rearm: !workflow.run_once_per_device && fresh_event,
                }))
            }
        }
    }

    /// 为目标设备创建执行记录；允许重复执行时重新启用已结束的记录
    async fn ensure_executions(
        &self,
        workflow: &Workflow,
        firing: &Firing,
        now: DateTime<Utc>,
    ) -> FleetResult<()> {
        for device_id in &firing.targets {
            let dependency = self.dependencies.check_for_device(workflow, device_id).await?;
            let initial = if dependency.satisfied {
                ExecutionStatus::Pending
            } else {
                ExecutionStatus::Skipped
            };

            let mut fresh = Execution::new(workflow.id, device_id.as_str(), initial);
            fresh.result = dependency.reason.as_ref().map(|reason| json!({ "reason": reason }));
            let (existing, created) = self.repos.executions.get_or_create(&fresh).await?;
            if created {
                debug!(
                    "工作流 {} 为设备 {} 创建执行记录 {}，状态 {}",
                    workflow.id, device_id, existing.id, initial
                );
                continue;
            }

            let rearmable = matches!(
                existing.status,
                ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
            );
            if firing.rearm && rearmable {
                let mut rearmed = existing.clone();
                rearmed.status = initial;
                rearmed.attempts = 0;
                rearmed.task_id = None;
                rearmed.next_retry_at = None;
                rearmed.result = fresh.result.clone();
                rearmed.scheduled_at = now;
                rearmed.started_at = None;
                rearmed.completed_at = None;
                rearmed.updated_at = now;
                self.save_execution(&rearmed, existing.status).await?;
            }
        }
        Ok(())
    }

    /// 前置工作流已成功的跳过记录恢复为待执行
    async fn release_skipped(&self, workflow: &Workflow, now: DateTime<Utc>) -> FleetResult<()> {
        if !workflow.has_dependency() {
            return Ok(());
        }
        for execution in self
            .repos
            .executions
            .list_by_status(workflow.id, ExecutionStatus::Skipped)
            .await?
        {
            let dependency = self
                .dependencies
                .check_for_device(workflow, &execution.device_id)
                .await?;
            if dependency.satisfied {
                let mut next = execution.clone();
                next.status = ExecutionStatus::Pending;
                next.result = None;
                next.updated_at = now;
                self.save_execution(&next, ExecutionStatus::Skipped).await?;
            }
        }
        Ok(())
    }

    /// 在并发上限和速率上限内准入待执行记录
    async fn admit_pending(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
        connecting: Option<&str>,
        settled: &mut Vec<i64>,
    ) -> FleetResult<usize> {
        let stats = self.repos.executions.stats(workflow.id).await?;
        let mut budget = if workflow.max_concurrent == 0 {
            u64::MAX
        } else {
            u64::from(workflow.max_concurrent).saturating_sub(stats.in_flight())
        };
        if workflow.rate_limit > 0 {
            let created = self
                .repos
                .tasks
                .count_created_for_workflow_since(
                    workflow.id,
                    now - Duration::minutes(RATE_WINDOW_MINUTES),
                )
                .await?;
            budget = budget.min(u64::from(workflow.rate_limit).saturating_sub(created));
        }
        if budget == 0 {
            debug!("工作流 {} 已达到并发或速率上限", workflow.id);
            return Ok(0);
        }

        let mut pending: Vec<Execution> = self
            .repos
            .executions
            .list_by_status(workflow.id, ExecutionStatus::Pending)
            .await?
            .into_iter()
            .filter(|execution| execution.is_due(now))
            .collect();
        if let Some(device_id) = connecting {
            pending.sort_by_key(|execution| execution.device_id != device_id);
        }

        let mut admitted = 0;
        for execution in pending {
            if admitted >= budget {
                break;
            }
            let execution_id = execution.id;
            match self.admit(workflow, execution, now, connecting).await {
                Ok(AdmitOutcome::Queued) => admitted += 1,
                Ok(AdmitOutcome::Completed) => settled.push(workflow.id),
                Ok(AdmitOutcome::Failed | AdmitOutcome::Deferred) => {}
                Err(e) => warn!("准入执行记录 {} 失败，下次调度时重试: {}", execution_id, e),
            }
        }

        if admitted > 0 {
            info!("工作流 {} 本次准入 {} 个执行记录", workflow.id, admitted);
        }
        Ok(admitted as usize)
    }

    async fn admit(
        &self,
        workflow: &Workflow,
        execution: Execution,
        now: DateTime<Utc>,
        connecting: Option<&str>,
    ) -> FleetResult<AdmitOutcome> {
        if workflow.has_dependency() {
            let dependency = self
                .dependencies
                .check_for_device(workflow, &execution.device_id)
                .await?;
            if !dependency.satisfied {
                let mut skipped = execution.clone();
                skipped.status = ExecutionStatus::Skipped;
                skipped.result = dependency.reason.map(|reason| json!({ "reason": reason }));
                skipped.updated_at = now;
                self.save_execution(&skipped, ExecutionStatus::Pending).await?;
                return Ok(AdmitOutcome::Deferred);
            }
        }

        let Some(device) = self.repos.devices.get(&execution.device_id).await? else {
            self.fail_without_retry(
                workflow,
                &execution,
                ExecutionStatus::Pending,
                &format!("设备 {} 不存在", execution.device_id),
                now,
            )
            .await?;
            return Ok(AdmitOutcome::Failed);
        };

        let mut queued = execution.clone();
        queued.status = ExecutionStatus::Queued;
        queued.attempts += 1;
        queued.next_retry_at = None;
        queued.started_at = execution.started_at.or(Some(now));
        queued.updated_at = now;
        if !self.save_execution(&queued, ExecutionStatus::Pending).await? {
            return Ok(AdmitOutcome::Deferred);
        }

        match self.issue(workflow, &queued, &device, 0).await {
            Ok(Work::Task(task)) => {
                queued.task_id = Some(task.id);
                self.repos
                    .executions
                    .compare_and_set(&queued, ExecutionStatus::Queued)
                    .await?;
                self.wake(device, connecting);
                Ok(AdmitOutcome::Queued)
            }
            Ok(Work::AlreadyDone(result)) => {
                self.finish(&queued, ExecutionStatus::Queued, ExecutionStatus::Completed, Some(result), now)
                    .await?;
                Ok(AdmitOutcome::Completed)
            }
            Err(e) if e.is_configuration_error() => {
                self.fail_without_retry(workflow, &queued, ExecutionStatus::Queued, &e.to_string(), now)
                    .await?;
                Ok(AdmitOutcome::Failed)
            }
            Err(e) => {
                let mut reverted = queued.clone();
                reverted.status = ExecutionStatus::Pending;
                reverted.attempts = execution.attempts;
                reverted.updated_at = Utc::now();
                self.save_execution(&reverted, ExecutionStatus::Queued).await?;
                Err(e)
            }
        }
    }

    /// 为执行记录生成并创建任务
    async fn issue(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        device: &Device,
        hops_applied: u64,
    ) -> FleetResult<Work> {
        let work = self.build_work(workflow, device, hops_applied).await?;
        match work {
            Work::Task(task) => {
                let task = task.for_execution(workflow.id, execution.id);
                Ok(Work::Task(self.tasks.create_task(task).await?))
            }
            done => Ok(done),
        }
    }

    async fn build_work(
        &self,
        workflow: &Workflow,
        device: &Device,
        hops_applied: u64,
    ) -> FleetResult<Work> {
        if workflow.task_kind != TaskKind::DownloadFirmware {
            return Ok(Work::Task(Task::new(
                device.id.clone(),
                workflow.task_kind,
                workflow.parameters.clone(),
            )));
        }

        let target_version = workflow
            .parameters
            .get("target_version")
            .and_then(Value::as_str);
        let plan = self
            .resolver
            .plan(&device.device_type, &device.firmware_version, target_version)
            .await?;

        let Some(hop) = plan.next_hop() else {
            return Ok(Work::AlreadyDone(json!({
                "firmware_version": device.firmware_version,
                "hops_applied": hops_applied,
            })));
        };

        let total_hops = hops_applied + plan.hops.len() as u64;
        if total_hops > u64::from(self.config.max_firmware_hops) {
            return Err(FleetError::Configuration(format!(
                "设备 {} 从 {} 升级到 {} 需要 {} 跳，超过上限 {}",
                device.id,
                device.firmware_version,
                plan.target.version,
                total_hops,
                self.config.max_firmware_hops
            )));
        }

        let mut payload = match &workflow.parameters {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        payload.insert("target_version".to_string(), json!(hop.version));
        payload.insert("download_ref".to_string(), json!(hop.download_ref));
        payload.insert("size".to_string(), json!(hop.size));
        payload.insert("final_version".to_string(), json!(plan.target.version));
        payload.insert("hop_index".to_string(), json!(hops_applied + 1));

        Ok(Work::Task(Task::new(
            device.id.clone(),
            TaskKind::DownloadFirmware,
            Value::Object(payload),
        )))
    }

    fn wake(&self, device: Device, connecting: Option<&str>) {
        if !self.config.wake_on_queue || connecting == Some(device.id.as_str()) {
            return;
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch_detached(device);
        }
    }

    async fn apply_task_outcome(
        &self,
        workflow: &Workflow,
        execution: Execution,
        task: &Task,
        now: DateTime<Utc>,
        settled: &mut Vec<i64>,
    ) -> FleetResult<()> {
        let stale = !execution.status.is_in_flight()
            || execution.task_id.is_some_and(|id| id != task.id);
        if stale {
            debug!(
                "执行记录 {} 当前状态为 {}，忽略任务 {} 的结果",
                execution.id, execution.status, task.id
            );
            return Ok(());
        }

        match task.status {
            TaskStatus::Completed => {
                if let Some((awaiting, final_version, hop_index)) = intermediate_hop(task) {
                    let mut waiting = execution.clone();
                    waiting.status = ExecutionStatus::InProgress;
                    waiting.task_id = Some(task.id);
                    waiting.result = Some(json!({
                        "awaiting_version": awaiting,
                        "final_version": final_version,
                        "hops_applied": hop_index,
                    }));
                    waiting.updated_at = now;
                    self.save_execution(&waiting, execution.status).await?;
                    info!(
                        "设备 {} 已完成升级到中间版本 {}，等待设备重新连接",
                        execution.device_id, awaiting
                    );
                    return Ok(());
                }

                let result = task.result.clone().unwrap_or_else(|| json!({}));
                if self
                    .finish(&execution, execution.status, ExecutionStatus::Completed, Some(result), now)
                    .await?
                {
                    settled.push(workflow.id);
                }
            }
            TaskStatus::Failed => {
                let error = task
                    .error
                    .clone()
                    .unwrap_or_else(|| "任务失败".to_string());
                self.handle_failure(workflow, &execution, &error, now).await?;
            }
            TaskStatus::Cancelled => {
                self.finish(
                    &execution,
                    execution.status,
                    ExecutionStatus::Cancelled,
                    Some(json!({ "reason": "任务已被取消" })),
                    now,
                )
                .await?;
            }
            TaskStatus::Pending | TaskStatus::Sent => {}
        }
        Ok(())
    }

    /// 设备连接时继续多跳固件升级
    async fn continue_firmware_upgrades(
        &self,
        device: &Device,
        now: DateTime<Utc>,
        settled: &mut Vec<i64>,
    ) -> FleetResult<()> {
        for candidate in self.repos.executions.list_for_device(&device.id).await? {
            if candidate.status != ExecutionStatus::InProgress || awaiting_version(&candidate).is_none() {
                continue;
            }

            let lock = self.workflow_lock(candidate.workflow_id).await;
            let _guard = lock.lock().await;

            let Some(execution) = self.repos.executions.get(candidate.id).await? else {
                continue;
            };
            let Some(awaiting) = awaiting_version(&execution) else {
                continue;
            };
            let Some(workflow) = self.repos.workflows.get(execution.workflow_id).await? else {
                continue;
            };
            if execution.status != ExecutionStatus::InProgress || workflow.status.is_terminal() {
                continue;
            }

            if device.firmware_version != awaiting {
                let error = format!(
                    "固件升级未生效: 期望版本 {}，设备上报 {}",
                    awaiting, device.firmware_version
                );
                self.handle_failure(&workflow, &execution, &error, now).await?;
                self.evaluate_workflow_state(workflow.id).await?;
                continue;
            }

            let hops_applied = execution
                .result
                .as_ref()
                .and_then(|r| r.get("hops_applied"))
                .and_then(Value::as_u64)
                .unwrap_or(0);

            match self.issue(&workflow, &execution, device, hops_applied).await {
                Ok(Work::Task(task)) => {
                    let mut next = execution.clone();
                    next.task_id = Some(task.id);
                    next.result = Some(json!({ "hops_applied": hops_applied }));
                    next.updated_at = now;
                    self.save_execution(&next, ExecutionStatus::InProgress).await?;
                }
                Ok(Work::AlreadyDone(result)) => {
                    if self
                        .finish(
                            &execution,
                            ExecutionStatus::InProgress,
                            ExecutionStatus::Completed,
                            Some(result),
                            now,
                        )
                        .await?
                    {
                        settled.push(workflow.id);
                    }
                }
                Err(e) if e.is_configuration_error() => {
                    self.fail_without_retry(
                        &workflow,
                        &execution,
                        ExecutionStatus::InProgress,
                        &e.to_string(),
                        now,
                    )
                    .await?;
                }
                Err(e) => return Err(e),
            }
            self.evaluate_workflow_state(workflow.id).await?;
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        error: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<()> {
        match RetryPolicy::decide(workflow, execution, now) {
            RetryDecision::Retry { next_retry_at } => {
                let mut retry = execution.clone();
                retry.status = ExecutionStatus::Pending;
                retry.next_retry_at = Some(next_retry_at);
                retry.result = Some(json!({ "error": error }));
                retry.updated_at = now;
                if self.save_execution(&retry, execution.status).await? {
                    info!(
                        "执行记录 {} 第 {} 次尝试失败，将于 {} 重试",
                        execution.id,
                        execution.attempts,
                        next_retry_at.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
            }
            RetryDecision::GiveUp => {
                self.finish(
                    execution,
                    execution.status,
                    ExecutionStatus::Failed,
                    Some(json!({ "error": error })),
                    now,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn fail_without_retry(
        &self,
        workflow: &Workflow,
        execution: &Execution,
        expected: ExecutionStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> FleetResult<bool> {
        StructuredLogger::log_configuration_error(workflow.id, &execution.device_id, message);
        self.finish(
            execution,
            expected,
            ExecutionStatus::Failed,
            Some(json!({ "error": message, "configuration_error": true })),
            now,
        )
        .await
    }

    async fn finish(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
        status: ExecutionStatus,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let mut next = execution.clone();
        next.status = status;
        next.result = result;
        next.next_retry_at = None;
        next.completed_at = Some(now);
        next.updated_at = now;
        self.save_execution(&next, expected).await
    }

    async fn save_execution(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> FleetResult<bool> {
        let applied = self
            .repos
            .executions
            .compare_and_set(execution, expected)
            .await?;
        if applied {
            if expected != execution.status {
                StructuredLogger::log_execution_transition(
                    execution.id,
                    execution.workflow_id,
                    &execution.device_id,
                    expected,
                    execution.status,
                );
            }
        } else {
            debug!("执行记录 {} 已被其他参与者更新", execution.id);
        }
        Ok(applied)
    }

    /// 熔断与完成判定，返回工作流是否仍处于激活状态
    async fn evaluate_workflow_state(&self, workflow_id: i64) -> FleetResult<bool> {
        let Some(workflow) = self.repos.workflows.get(workflow_id).await? else {
            return Ok(false);
        };
        if !workflow.is_active() {
            return Ok(false);
        }

        let stats = self.repos.executions.stats(workflow_id).await?;
        let now = Utc::now();

        let threshold = workflow.stop_on_failure_percent;
        let decided = stats.failed + stats.completed;
        if threshold > 0
            && decided >= u64::from(self.config.breaker_min_samples)
            && stats.failure_ratio() * 100.0 >= f64::from(threshold)
        {
            if self
                .repos
                .workflows
                .transition_status(workflow_id, WorkflowStatus::Active, WorkflowStatus::Paused, now)
                .await?
            {
                StructuredLogger::log_workflow_paused(
                    workflow_id,
                    stats.failed,
                    stats.completed,
                    threshold,
                );
            }
            return Ok(false);
        }

        let open = stats.pending + stats.queued + stats.in_progress;
        if workflow.completes_when_settled() && stats.total() > 0 && open == 0 {
            let skipped_settled = stats.skipped == 0 || self.predecessor_finished(&workflow).await?;
            if skipped_settled
                && self
                    .repos
                    .workflows
                    .transition_status(
                        workflow_id,
                        WorkflowStatus::Active,
                        WorkflowStatus::Completed,
                        now,
                    )
                    .await?
            {
                StructuredLogger::log_workflow_completed(workflow_id, stats.total());
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// 前置工作流已结束时，跳过的执行记录不会再被释放
    async fn predecessor_finished(&self, workflow: &Workflow) -> FleetResult<bool> {
        let Some(dependency_id) = workflow.depends_on_workflow_id else {
            return Ok(true);
        };
        Ok(self
            .repos
            .workflows
            .get(dependency_id)
            .await?
            .map_or(true, |predecessor| predecessor.status.is_terminal()))
    }
}

fn awaiting_version(execution: &Execution) -> Option<String> {
    execution
        .result
        .as_ref()?
        .get("awaiting_version")?
        .as_str()
        .map(str::to_string)
}

/// 中间跳升级任务成功时返回 (已安装版本, 最终版本, 跳序号)
fn intermediate_hop(task: &Task) -> Option<(String, String, u64)> {
    if task.kind != TaskKind::DownloadFirmware {
        return None;
    }
    let installed = task.payload.get("target_version")?.as_str()?;
    let final_version = task.payload.get("final_version")?.as_str()?;
    if installed == final_version {
        return None;
    }
    let hop_index = task
        .payload
        .get("hop_index")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    Some((installed.to_string(), final_version.to_string(), hop_index))
}
