use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use fleet_core::{
    traits::GroupRepository, Device, DeviceGroup, Execution, FleetError, FleetResult, MatchType,
    Rule, ScheduleMode, Task, TaskKind, Workflow, WorkflowProgress, WorkflowStatus,
};

use crate::connection_dispatcher::ConnectionDispatcher;
use crate::cron_utils::CronScheduler;
use crate::dependency_checker::{DependencyCheckService, DependencyChecker};
use crate::membership_index::{MembershipDelta, MembershipIndex};
use crate::rule_matcher::validate_rules;
use crate::scheduler::{SchedulerRepositories, SchedulerTrigger, WorkflowScheduler};
use crate::task_state_machine::{ReportOutcome, TaskReport, TaskStateMachine};

/// 设备连接处理结果
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub device_id: String,
    pub newly_online: bool,
    pub joined_groups: Vec<i64>,
    pub left_groups: Vec<i64>,
    /// 本次连接触发准入的执行数量
    pub admitted: usize,
}

/// 编排引擎的操作入口
///
/// 协议适配器钩子和管理控制台操作都经过这里，HTTP 层只做参数转换。
pub struct FleetController {
    repos: SchedulerRepositories,
    groups: Arc<dyn GroupRepository>,
    tasks: Arc<TaskStateMachine>,
    membership: Arc<MembershipIndex>,
    scheduler: Arc<WorkflowScheduler>,
    dependencies: DependencyChecker,
    dispatcher: Option<Arc<ConnectionDispatcher>>,
}

impl FleetController {
    pub fn new(
        repos: SchedulerRepositories,
        groups: Arc<dyn GroupRepository>,
        tasks: Arc<TaskStateMachine>,
        membership: Arc<MembershipIndex>,
        scheduler: Arc<WorkflowScheduler>,
    ) -> Self {
        let dependencies =
            DependencyChecker::new(repos.workflows.clone(), repos.executions.clone());
        Self {
            repos,
            groups,
            tasks,
            membership,
            scheduler,
            dependencies,
            dispatcher: None,
        }
    }

    /// 运维人员创建任务后通过该分发器唤醒设备
    pub fn with_dispatcher(mut self, dispatcher: Arc<ConnectionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn scheduler(&self) -> &Arc<WorkflowScheduler> {
        &self.scheduler
    }

    pub fn membership(&self) -> &Arc<MembershipIndex> {
        &self.membership
    }

    // ---- 协议适配器钩子 ----

    /// 设备连接到服务器
    ///
    /// 合并上报的属性，增量更新分组成员关系，然后触发调度。
    pub async fn device_connected(
        &self,
        device_id: &str,
        attributes: &BTreeMap<String, Value>,
    ) -> FleetResult<ConnectOutcome> {
        let now = Utc::now();
        let (mut device, is_new) = match self.repos.devices.get(device_id).await? {
            Some(device) => (device, false),
            None => (Device::new(device_id), true),
        };

        let changed = device.apply_report(attributes);
        let newly_online = !device.online;
        device.online = true;
        device.last_contact_at = Some(now);
        device.updated_at = now;
        self.repos.devices.upsert(&device).await?;

        if is_new {
            info!("新设备 {} 首次连接", device_id);
        }
        let delta: MembershipDelta = self
            .membership
            .on_device_changed(&device, (!is_new).then_some(changed.as_slice()))
            .await;

        let admitted = self
            .scheduler
            .handle(SchedulerTrigger::DeviceConnected {
                device_id: device_id.to_string(),
                newly_online,
                joined_groups: delta.joined.clone(),
            })
            .await?;

        Ok(ConnectOutcome {
            device_id: device_id.to_string(),
            newly_online,
            joined_groups: delta.joined,
            left_groups: delta.left,
            admitted,
        })
    }

    /// 设备会话结束，之后的连接视为重新上线
    pub async fn device_disconnected(&self, device_id: &str) -> FleetResult<()> {
        let device = self
            .repos
            .devices
            .get(device_id)
            .await?
            .ok_or_else(|| FleetError::device_not_found(device_id))?;
        self.repos
            .devices
            .set_online(device_id, false, device.last_contact_at)
            .await?;
        debug!("设备 {} 已离线", device_id);
        Ok(())
    }

    pub async fn deliver_next_task(&self, device_id: &str) -> FleetResult<Option<Task>> {
        self.tasks.deliver_next_task(device_id).await
    }

    pub async fn report_task_result(
        &self,
        task_id: i64,
        report: TaskReport,
    ) -> FleetResult<ReportOutcome> {
        self.tasks.report_result(task_id, report).await
    }

    // ---- 设备分组 ----

    pub async fn create_group(&self, group: DeviceGroup) -> FleetResult<DeviceGroup> {
        Self::validate_group(&group)?;
        let created = self.groups.create(&group).await?;
        self.membership.on_group_changed(created.id).await?;
        info!("设备分组 {} ({}) 已创建", created.name, created.id);
        Ok(created)
    }

    /// 更新分组并整体替换规则
    pub async fn update_group(&self, group: DeviceGroup) -> FleetResult<DeviceGroup> {
        Self::validate_group(&group)?;
        if self.groups.get(group.id).await?.is_none() {
            return Err(FleetError::GroupNotFound { id: group.id });
        }
        let updated = self.groups.update(&group).await?;
        self.membership.on_group_changed(updated.id).await?;
        info!("设备分组 {} 已更新", updated.id);
        Ok(updated)
    }

    pub async fn get_group(&self, group_id: i64) -> FleetResult<DeviceGroup> {
        self.groups
            .get(group_id)
            .await?
            .ok_or(FleetError::GroupNotFound { id: group_id })
    }

    pub async fn list_groups(&self) -> FleetResult<Vec<DeviceGroup>> {
        self.groups.list_all().await
    }

    pub async fn preview_group(&self, match_type: MatchType, rules: &[Rule]) -> FleetResult<Vec<String>> {
        self.membership.preview(match_type, rules).await
    }

    pub async fn group_members(&self, group_id: i64) -> FleetResult<Vec<String>> {
        self.get_group(group_id).await?;
        Ok(self.membership.members_of(group_id).await)
    }

    fn validate_group(group: &DeviceGroup) -> FleetResult<()> {
        if group.name.trim().is_empty() {
            return Err(FleetError::validation_error("分组名称不能为空"));
        }
        validate_rules(&group.rules)
    }

    // ---- 工作流 ----

    /// 创建草稿状态的工作流
    ///
    /// 配置错误（分组不存在、调度参数缺失、依赖成环）在这里拒绝，而不是在执行时发现。
    pub async fn create_workflow(&self, workflow: Workflow) -> FleetResult<Workflow> {
        if workflow.name.trim().is_empty() {
            return Err(FleetError::validation_error("工作流名称不能为空"));
        }
        self.get_group(workflow.group_id).await?;

        match workflow.schedule_mode {
            ScheduleMode::Scheduled if workflow.scheduled_at.is_none() => {
                return Err(FleetError::validation_error(
                    "SCHEDULED 工作流需要 scheduled_at",
                ));
            }
            ScheduleMode::Recurring => {
                let expression = workflow.cron_expression.as_deref().ok_or_else(|| {
                    FleetError::validation_error("RECURRING 工作流需要 cron_expression")
                })?;
                CronScheduler::validate_cron_expression(expression)?;
            }
            _ => {}
        }

        workflow.task_kind.validate_payload(&workflow.parameters)?;
        if workflow.stop_on_failure_percent > 100 {
            return Err(FleetError::validation_error(
                "stop_on_failure_percent 必须在 0 到 100 之间",
            ));
        }
        self.dependencies
            .validate_dependency(workflow.id, workflow.depends_on_workflow_id)
            .await?;

        let mut draft = workflow;
        let now = Utc::now();
        draft.status = WorkflowStatus::Draft;
        draft.activated_at = None;
        draft.last_fired_at = None;
        draft.created_at = now;
        draft.updated_at = now;

        let created = self.repos.workflows.create(&draft).await?;
        info!("工作流 {} ({}) 已创建", created.name, created.id);
        Ok(created)
    }

    pub async fn get_workflow(&self, workflow_id: i64) -> FleetResult<Workflow> {
        self.repos
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(FleetError::WorkflowNotFound { id: workflow_id })
    }

    pub async fn list_workflows(&self) -> FleetResult<Vec<Workflow>> {
        self.repos.workflows.list_all().await
    }

    pub async fn activate_workflow(&self, workflow_id: i64) -> FleetResult<Workflow> {
        let workflow = self.transition_workflow(workflow_id, WorkflowStatus::Draft, WorkflowStatus::Active).await?;
        self.scheduler
            .handle(SchedulerTrigger::WorkflowActivated(workflow_id))
            .await?;
        Ok(workflow)
    }

    pub async fn pause_workflow(&self, workflow_id: i64) -> FleetResult<Workflow> {
        self.transition_workflow(workflow_id, WorkflowStatus::Active, WorkflowStatus::Paused)
            .await
    }

    /// 恢复被暂停（包括被熔断暂停）的工作流
    pub async fn resume_workflow(&self, workflow_id: i64) -> FleetResult<Workflow> {
        let workflow = self
            .transition_workflow(workflow_id, WorkflowStatus::Paused, WorkflowStatus::Active)
            .await?;
        self.scheduler
            .handle(SchedulerTrigger::WorkflowActivated(workflow_id))
            .await?;
        Ok(workflow)
    }

    pub async fn cancel_workflow(&self, workflow_id: i64) -> FleetResult<Workflow> {
        let current = self.get_workflow(workflow_id).await?;
        let workflow = self
            .transition_workflow(workflow_id, current.status, WorkflowStatus::Cancelled)
            .await?;
        self.scheduler.cancel_open_executions(workflow_id).await?;
        Ok(workflow)
    }

    async fn transition_workflow(
        &self,
        workflow_id: i64,
        expected: WorkflowStatus,
        next: WorkflowStatus,
    ) -> FleetResult<Workflow> {
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status != expected || !workflow.status.can_transition_to(next) {
            return Err(FleetError::invalid_transition("workflow", workflow.status, next));
        }
        if !self
            .repos
            .workflows
            .transition_status(workflow_id, expected, next, Utc::now())
            .await?
        {
            warn!("工作流 {} 的状态已被并发修改", workflow_id);
            return Err(FleetError::invalid_transition("workflow", expected, next));
        }
        info!("工作流 {} 状态变更: {} -> {}", workflow_id, expected, next);
        self.get_workflow(workflow_id).await
    }

    pub async fn workflow_progress(&self, workflow_id: i64) -> FleetResult<WorkflowProgress> {
        self.scheduler.progress(workflow_id).await
    }

    pub async fn workflow_executions(&self, workflow_id: i64) -> FleetResult<Vec<Execution>> {
        self.get_workflow(workflow_id).await?;
        self.repos.executions.list_for_workflow(workflow_id).await
    }

    // ---- 任务 ----

    /// 运维人员直接对设备下发任务
    pub async fn create_task(
        &self,
        device_id: &str,
        kind: TaskKind,
        payload: Value,
        operator: &str,
    ) -> FleetResult<Task> {
        let task = self
            .tasks
            .create_task(Task::new(device_id, kind, payload).with_initiator(operator))
            .await?;

        if let Some(dispatcher) = &self.dispatcher {
            if let Some(device) = self.repos.devices.get(device_id).await? {
                dispatcher.dispatch_detached(device);
            }
        }
        Ok(task)
    }

    pub async fn get_task(&self, task_id: i64) -> FleetResult<Task> {
        self.tasks.get_task(task_id).await
    }

    pub async fn device_tasks(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        self.repos.tasks.list_for_device(device_id).await
    }

    pub async fn cancel_task(&self, task_id: i64) -> FleetResult<Task> {
        self.tasks.cancel_task(task_id).await
    }

    pub async fn retry_task(&self, task_id: i64, operator: &str) -> FleetResult<Task> {
        self.tasks.retry_task(task_id, operator).await
    }
}
