#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use fleet_config::{SchedulerConfig, TaskTimeoutConfig};
use fleet_core::{
    DeviceGroup, Execution, ExecutionStatus, RuleOperator, Task, Workflow, WorkflowProgress,
};
use fleet_dispatcher::{
    ConnectOutcome, ConnectionDispatcher, FirmwarePathResolver, FleetController, MembershipIndex,
    SchedulerRepositories, StateListener, TaskReport, TaskStateMachine, WorkflowScheduler,
};
use fleet_testing_utils::{
    GroupBuilder, MockDeviceRepository, MockExecutionRepository, MockFirmwareRepository,
    MockGroupRepository, MockTaskRepository, MockWorkflowRepository,
};

/// 基于内存仓储组装的完整编排引擎
pub struct Harness {
    pub devices: Arc<MockDeviceRepository>,
    pub tasks: Arc<MockTaskRepository>,
    pub groups: Arc<MockGroupRepository>,
    pub workflows: Arc<MockWorkflowRepository>,
    pub executions: Arc<MockExecutionRepository>,
    pub firmware: Arc<MockFirmwareRepository>,
    pub state_machine: Arc<TaskStateMachine>,
    pub scheduler: Arc<WorkflowScheduler>,
    pub controller: FleetController,
    pub listener: StateListener,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(SchedulerConfig::default(), TaskTimeoutConfig::default(), None)
    }

    pub fn with_scheduler_config(config: SchedulerConfig) -> Self {
        Self::build(config, TaskTimeoutConfig::default(), None)
    }

    pub fn with_timeouts(timeouts: TaskTimeoutConfig) -> Self {
        Self::build(SchedulerConfig::default(), timeouts, None)
    }

    pub fn with_dispatcher(dispatcher: Arc<ConnectionDispatcher>) -> Self {
        Self::build(
            SchedulerConfig::default(),
            TaskTimeoutConfig::default(),
            Some(dispatcher),
        )
    }

    pub fn build(
        config: SchedulerConfig,
        timeouts: TaskTimeoutConfig,
        dispatcher: Option<Arc<ConnectionDispatcher>>,
    ) -> Self {
        let devices = Arc::new(MockDeviceRepository::new());
        let tasks = Arc::new(MockTaskRepository::new());
        let groups = Arc::new(MockGroupRepository::new());
        let workflows = Arc::new(MockWorkflowRepository::new());
        let executions = Arc::new(MockExecutionRepository::new());
        let firmware = Arc::new(MockFirmwareRepository::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state_machine = Arc::new(
            TaskStateMachine::new(tasks.clone(), devices.clone(), workflows.clone(), timeouts)
                .with_events(events_tx),
        );
        let membership = Arc::new(MembershipIndex::new(devices.clone(), groups.clone()));
        let resolver = Arc::new(FirmwarePathResolver::new(firmware.clone()));
        let repos = SchedulerRepositories {
            devices: devices.clone(),
            tasks: tasks.clone(),
            workflows: workflows.clone(),
            executions: executions.clone(),
        };

        let mut scheduler = WorkflowScheduler::new(
            repos.clone(),
            membership.clone(),
            resolver,
            state_machine.clone(),
            config,
        );
        if let Some(dispatcher) = &dispatcher {
            scheduler = scheduler.with_dispatcher(dispatcher.clone());
        }
        let scheduler = Arc::new(scheduler);

        let mut controller = FleetController::new(
            repos,
            groups.clone(),
            state_machine.clone(),
            membership,
            scheduler.clone(),
        );
        if let Some(dispatcher) = dispatcher {
            controller = controller.with_dispatcher(dispatcher);
        }

        let listener = StateListener::new(scheduler.clone(), events_rx);

        Self {
            devices,
            tasks,
            groups,
            workflows,
            executions,
            firmware,
            state_machine,
            scheduler,
            controller,
            listener,
        }
    }

    /// 以指定型号连接设备（设备类型 hgw，固件 V1）
    pub async fn connect(&mut self, device_id: &str, model: &str) -> ConnectOutcome {
        self.connect_with(
            device_id,
            &[
                ("manufacturer", json!("Acme")),
                ("model", json!(model)),
                ("device_type", json!("hgw")),
                ("firmware_version", json!("V1")),
            ],
        )
        .await
    }

    pub async fn connect_with(&mut self, device_id: &str, report: &[(&str, Value)]) -> ConnectOutcome {
        let report: BTreeMap<String, Value> = report
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        let outcome = self
            .controller
            .device_connected(device_id, &report)
            .await
            .unwrap();
        self.settle().await;
        outcome
    }

    pub async fn disconnect(&mut self, device_id: &str) {
        self.controller.device_disconnected(device_id).await.unwrap();
    }

    /// 处理所有排队的任务事件，直到没有新事件产生
    pub async fn settle(&mut self) {
        while self.listener.drain().await > 0 {}
    }

    pub async fn deliver(&mut self, device_id: &str) -> Option<Task> {
        let task = self.controller.deliver_next_task(device_id).await.unwrap();
        self.settle().await;
        task
    }

    pub async fn report(&mut self, task_id: i64, report: TaskReport) {
        self.controller
            .report_task_result(task_id, report)
            .await
            .unwrap();
        self.settle().await;
    }

    /// 下发设备的下一个任务并上报成功
    pub async fn complete_next(&mut self, device_id: &str) -> Task {
        let task = self
            .deliver(device_id)
            .await
            .unwrap_or_else(|| panic!("设备 {device_id} 没有可下发的任务"));
        self.report(task.id, TaskReport::success(Some(json!({"ok": true}))))
            .await;
        task
    }

    /// 下发设备的下一个任务并上报失败
    pub async fn fail_next(&mut self, device_id: &str, error: &str) -> Task {
        let task = self
            .deliver(device_id)
            .await
            .unwrap_or_else(|| panic!("设备 {device_id} 没有可下发的任务"));
        self.report(task.id, TaskReport::failure(error)).await;
        task
    }

    /// 创建按型号匹配的分组
    pub async fn model_group(&self, name: &str, model: &str) -> DeviceGroup {
        self.controller
            .create_group(
                GroupBuilder::new(name)
                    .with_rule("model", RuleOperator::Equals, Some(model))
                    .build(),
            )
            .await
            .unwrap()
    }

    /// 创建并激活工作流
    pub async fn start_workflow(&mut self, workflow: Workflow) -> Workflow {
        let created = self.controller.create_workflow(workflow).await.unwrap();
        let activated = self.controller.activate_workflow(created.id).await.unwrap();
        self.settle().await;
        activated
    }

    pub async fn progress(&self, workflow_id: i64) -> WorkflowProgress {
        self.controller.workflow_progress(workflow_id).await.unwrap()
    }

    pub async fn execution(&self, workflow_id: i64, device_id: &str) -> Execution {
        self.executions
            .all_executions()
            .into_iter()
            .find(|e| e.workflow_id == workflow_id && e.device_id == device_id)
            .unwrap_or_else(|| panic!("工作流 {workflow_id} 在设备 {device_id} 上没有执行记录"))
    }

    /// 指定状态的执行记录所在的设备
    pub fn devices_with(&self, workflow_id: i64, status: ExecutionStatus) -> Vec<String> {
        self.executions
            .all_executions()
            .into_iter()
            .filter(|e| e.workflow_id == workflow_id && e.status == status)
            .map(|e| e.device_id)
            .collect()
    }

    pub async fn device_tasks(&self, device_id: &str) -> Vec<Task> {
        let mut tasks = self.controller.device_tasks(device_id).await.unwrap();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}
