//! 仓储接口的内存实现
//!
//! 语义与 SQLite 实现保持一致：条件更新比较当前状态，执行记录对
//! (workflow_id, device_id) 唯一。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use fleet_core::{
    Device, DeviceGroup, DeviceRepository, Execution, ExecutionRepository, ExecutionStats,
    ExecutionStatus, FirmwareImage, FirmwareRepository, FleetError, FleetResult, GroupRepository,
    Task, TaskRepository, TaskStatus, UpgradeEdge, Workflow, WorkflowRepository, WorkflowStatus,
};

/// DeviceRepository 的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockDeviceRepository {
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl MockDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.devices.lock().unwrap();
            for device in devices {
                map.insert(device.id.clone(), device);
            }
        }
        repo
    }

    pub fn clear(&self) {
        self.devices.lock().unwrap().clear();
    }

    pub fn count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}

#[async_trait]
impl DeviceRepository for MockDeviceRepository {
    async fn get(&self, id: &str) -> FleetResult<Option<Device>> {
        Ok(self.devices.lock().unwrap().get(id).cloned())
    }

    async fn upsert(&self, device: &Device) -> FleetResult<()> {
        self.devices
            .lock()
            .unwrap()
            .insert(device.id.clone(), device.clone());
        Ok(())
    }

    async fn list_all(&self) -> FleetResult<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.lock().unwrap().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn set_online(
        &self,
        id: &str,
        online: bool,
        last_contact_at: Option<DateTime<Utc>>,
    ) -> FleetResult<()> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(id)
            .ok_or_else(|| FleetError::device_not_found(id))?;
        device.online = online;
        if last_contact_at.is_some() {
            device.last_contact_at = last_contact_at;
        }
        device.updated_at = Utc::now();
        Ok(())
    }
}

/// TaskRepository 的内存实现
#[derive(Debug, Clone)]
pub struct MockTaskRepository {
    tasks: Arc<Mutex<HashMap<i64, Task>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
        *self.next_id.lock().unwrap() = 1;
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// 全部任务，按 ID 排序
    pub fn all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn status_of(&self, id: i64) -> Option<TaskStatus> {
        self.tasks.lock().unwrap().get(&id).map(|t| t.status)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    fn filtered(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| predicate(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

impl Default for MockTaskRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create(&self, task: &Task) -> FleetResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_task = task.clone();
        new_task.id = *next_id;
        *next_id += 1;

        tasks.insert(new_task.id, new_task.clone());
        Ok(new_task)
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> FleetResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&task.id) {
            Some(current) if current.status == expected => {
                *current = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(FleetError::TaskNotFound { id: task.id }),
        }
    }

    async fn claim_for_delivery(&self, task: &Task) -> FleetResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        let conflicting = task.kind.conflicting_kinds();
        let blocked = tasks.values().any(|t| {
            t.device_id == task.device_id
                && t.status == TaskStatus::Sent
                && conflicting.contains(&t.kind)
        });
        match tasks.get_mut(&task.id) {
            Some(current) if current.status == TaskStatus::Pending && !blocked => {
                current.status = TaskStatus::Sent;
                current.sent_at = task.sent_at;
                current.deadline_at = task.deadline_at;
                current.updated_at = task.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        Ok(self.filtered(|t| t.device_id == device_id && t.status == TaskStatus::Pending))
    }

    async fn sent_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        Ok(self.filtered(|t| t.device_id == device_id && t.status == TaskStatus::Sent))
    }

    async fn expired_sent(&self, now: DateTime<Utc>) -> FleetResult<Vec<Task>> {
        Ok(self.filtered(|t| t.is_expired(now)))
    }

    async fn count_created_for_workflow_since(
        &self,
        workflow_id: i64,
        since: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let count = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.workflow_id == Some(workflow_id) && t.created_at >= since)
            .count();
        Ok(count as u64)
    }

    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        let mut tasks = self.filtered(|t| t.device_id == device_id);
        tasks.reverse();
        Ok(tasks)
    }
}

/// GroupRepository 的内存实现
#[derive(Debug, Clone)]
pub struct MockGroupRepository {
    groups: Arc<Mutex<HashMap<i64, DeviceGroup>>>,
    next_id: Arc<Mutex<i64>>,
    next_rule_id: Arc<Mutex<i64>>,
}

impl MockGroupRepository {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
            next_rule_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn count(&self) -> usize {
        self.groups.lock().unwrap().len()
    }

    fn assign_rule_ids(&self, group: &mut DeviceGroup) {
        let mut next_rule_id = self.next_rule_id.lock().unwrap();
        for (position, rule) in group.rules.iter_mut().enumerate() {
            rule.id = *next_rule_id;
            rule.group_id = group.id;
            rule.position = position as i32;
            *next_rule_id += 1;
        }
    }
}

impl Default for MockGroupRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupRepository for MockGroupRepository {
    async fn create(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup> {
        let mut new_group = group.clone();
        {
            let mut next_id = self.next_id.lock().unwrap();
            new_group.id = *next_id;
            *next_id += 1;
        }
        self.assign_rule_ids(&mut new_group);

        self.groups
            .lock()
            .unwrap()
            .insert(new_group.id, new_group.clone());
        Ok(new_group)
    }

    async fn update(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup> {
        if !self.groups.lock().unwrap().contains_key(&group.id) {
            return Err(FleetError::GroupNotFound { id: group.id });
        }

        let mut updated = group.clone();
        updated.updated_at = Utc::now();
        self.assign_rule_ids(&mut updated);

        self.groups
            .lock()
            .unwrap()
            .insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn get(&self, id: i64) -> FleetResult<Option<DeviceGroup>> {
        Ok(self.groups.lock().unwrap().get(&id).cloned())
    }

    async fn list_all(&self) -> FleetResult<Vec<DeviceGroup>> {
        let mut groups: Vec<DeviceGroup> = self.groups.lock().unwrap().values().cloned().collect();
        groups.sort_by_key(|g| g.id);
        Ok(groups)
    }
}

/// WorkflowRepository 的内存实现
#[derive(Debug, Clone)]
pub struct MockWorkflowRepository {
    workflows: Arc<Mutex<HashMap<i64, Workflow>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockWorkflowRepository {
    pub fn new() -> Self {
        Self {
            workflows: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn count(&self) -> usize {
        self.workflows.lock().unwrap().len()
    }

    fn filtered(&self, predicate: impl Fn(&Workflow) -> bool) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self
            .workflows
            .lock()
            .unwrap()
            .values()
            .filter(|w| predicate(w))
            .cloned()
            .collect();
        workflows.sort_by_key(|w| w.id);
        workflows
    }
}

impl Default for MockWorkflowRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowRepository for MockWorkflowRepository {
    async fn create(&self, workflow: &Workflow) -> FleetResult<Workflow> {
        let mut workflows = self.workflows.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();

        let mut new_workflow = workflow.clone();
        new_workflow.id = *next_id;
        *next_id += 1;

        workflows.insert(new_workflow.id, new_workflow.clone());
        Ok(new_workflow)
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Workflow>> {
        Ok(self.workflows.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, workflow: &Workflow) -> FleetResult<()> {
        let mut workflows = self.workflows.lock().unwrap();
        let current = workflows
            .get_mut(&workflow.id)
            .ok_or(FleetError::WorkflowNotFound { id: workflow.id })?;

        // 状态只能通过 transition_status 修改
        let status = current.status;
        let activated_at = current.activated_at;
        *current = workflow.clone();
        current.status = status;
        current.activated_at = activated_at;
        current.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_status(
        &self,
        id: i64,
        expected: WorkflowStatus,
        next: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let mut workflows = self.workflows.lock().unwrap();
        let workflow = workflows
            .get_mut(&id)
            .ok_or(FleetError::WorkflowNotFound { id })?;

        if workflow.status != expected {
            return Ok(false);
        }

        workflow.status = next;
        workflow.updated_at = at;
        if next == WorkflowStatus::Active && workflow.activated_at.is_none() {
            workflow.activated_at = Some(at);
        }
        Ok(true)
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> FleetResult<Vec<Workflow>> {
        Ok(self.filtered(|w| w.status == status))
    }

    async fn list_all(&self) -> FleetResult<Vec<Workflow>> {
        Ok(self.filtered(|_| true))
    }
}

/// ExecutionRepository 的内存实现
#[derive(Debug, Clone)]
pub struct MockExecutionRepository {
    executions: Arc<Mutex<HashMap<i64, Execution>>>,
    next_id: Arc<Mutex<i64>>,
}

impl MockExecutionRepository {
    pub fn new() -> Self {
        Self {
            executions: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(Mutex::new(1)),
        }
    }

    pub fn count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }

    /// 全部执行记录，按 ID 排序
    pub fn all_executions(&self) -> Vec<Execution> {
        self.filtered(|_| true)
    }

    fn filtered(&self, predicate: impl Fn(&Execution) -> bool) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| predicate(e))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.id);
        executions
    }
}

impl Default for MockExecutionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionRepository for MockExecutionRepository {
    async fn get_or_create(&self, execution: &Execution) -> FleetResult<(Execution, bool)> {
        let mut executions = self.executions.lock().unwrap();

        if let Some(existing) = executions
            .values()
            .find(|e| e.workflow_id == execution.workflow_id && e.device_id == execution.device_id)
        {
            return Ok((existing.clone(), false));
        }

        let mut next_id = self.next_id.lock().unwrap();
        let mut new_execution = execution.clone();
        new_execution.id = *next_id;
        *next_id += 1;

        executions.insert(new_execution.id, new_execution.clone());
        Ok((new_execution, true))
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Execution>> {
        Ok(self.executions.lock().unwrap().get(&id).cloned())
    }

    async fn find(&self, workflow_id: i64, device_id: &str) -> FleetResult<Option<Execution>> {
        Ok(self
            .executions
            .lock()
            .unwrap()
            .values()
            .find(|e| e.workflow_id == workflow_id && e.device_id == device_id)
            .cloned())
    }

    async fn compare_and_set(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> FleetResult<bool> {
        let mut executions = self.executions.lock().unwrap();
        match executions.get_mut(&execution.id) {
            Some(current) if current.status == expected => {
                *current = execution.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(FleetError::ExecutionNotFound { id: execution.id }),
        }
    }

    async fn list_for_workflow(&self, workflow_id: i64) -> FleetResult<Vec<Execution>> {
        Ok(self.filtered(|e| e.workflow_id == workflow_id))
    }

    async fn list_by_status(
        &self,
        workflow_id: i64,
        status: ExecutionStatus,
    ) -> FleetResult<Vec<Execution>> {
        Ok(self.filtered(|e| e.workflow_id == workflow_id && e.status == status))
    }

    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Execution>> {
        Ok(self.filtered(|e| e.device_id == device_id))
    }

    async fn stats(&self, workflow_id: i64) -> FleetResult<ExecutionStats> {
        let mut stats = ExecutionStats::default();
        for execution in self.filtered(|e| e.workflow_id == workflow_id) {
            stats.add(execution.status, 1);
        }
        Ok(stats)
    }
}

/// FirmwareRepository 的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockFirmwareRepository {
    images: Arc<Mutex<Vec<FirmwareImage>>>,
    edges: Arc<Mutex<Vec<UpgradeEdge>>>,
}

impl MockFirmwareRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记固件镜像；`active` 为 true 时取代该设备类型原来的目标固件
    pub fn add_image(&self, device_type: &str, version: &str, active: bool) {
        let mut images = self.images.lock().unwrap();
        if active {
            for image in images.iter_mut().filter(|i| i.device_type == device_type) {
                image.active = false;
            }
        }
        images.retain(|i| !(i.device_type == device_type && i.version == version));
        images.push(FirmwareImage {
            device_type: device_type.to_string(),
            version: version.to_string(),
            download_ref: format!("https://firmware.example/{device_type}/{version}.bin"),
            size: 16 * 1024 * 1024,
            active,
        });
    }

    pub fn add_edge(&self, device_type: &str, from_version: &str, to_version: &str) {
        self.edges
            .lock()
            .unwrap()
            .push(UpgradeEdge::new(device_type, from_version, to_version));
    }
}

#[async_trait]
impl FirmwareRepository for MockFirmwareRepository {
    async fn active_firmware(&self, device_type: &str) -> FleetResult<Option<FirmwareImage>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.device_type == device_type && i.active)
            .cloned())
    }

    async fn firmware_image(
        &self,
        device_type: &str,
        version: &str,
    ) -> FleetResult<Option<FirmwareImage>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.device_type == device_type && i.version == version)
            .cloned())
    }

    async fn upgrade_path_edges(&self, device_type: &str) -> FleetResult<Vec<UpgradeEdge>> {
        let mut edges: Vec<UpgradeEdge> = self
            .edges
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.device_type == device_type)
            .cloned()
            .collect();
        edges.sort();
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::TaskKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_compare_and_set_checks_status() {
        let repo = MockTaskRepository::new();
        let task = repo
            .create(&Task::new("CPE-1", TaskKind::Reboot, json!({})))
            .await
            .unwrap();

        let mut sent = task.clone();
        sent.status = TaskStatus::Sent;
        assert!(repo.compare_and_set(&sent, TaskStatus::Pending).await.unwrap());
        assert!(!repo.compare_and_set(&sent, TaskStatus::Pending).await.unwrap());
        assert_eq!(repo.count_with_status(TaskStatus::Sent), 1);
    }

    #[tokio::test]
    async fn test_execution_get_or_create_is_unique() {
        let repo = MockExecutionRepository::new();
        let (first, created) = repo
            .get_or_create(&Execution::new(1, "CPE-1", ExecutionStatus::Pending))
            .await
            .unwrap();
        assert!(created);

        let (second, created) = repo
            .get_or_create(&Execution::new(1, "CPE-1", ExecutionStatus::Pending))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(repo.count(), 1);
    }

    #[tokio::test]
    async fn test_workflow_transition_sets_activation_time() {
        let repo = MockWorkflowRepository::new();
        let workflow = repo
            .create(&Workflow::new("wf", 1, TaskKind::Reboot, json!({})))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(repo
            .transition_status(workflow.id, WorkflowStatus::Draft, WorkflowStatus::Active, now)
            .await
            .unwrap());
        assert!(!repo
            .transition_status(workflow.id, WorkflowStatus::Draft, WorkflowStatus::Active, now)
            .await
            .unwrap());

        let stored = repo.get(workflow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Active);
        assert_eq!(stored.activated_at, Some(now));
    }
}
