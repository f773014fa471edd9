//! 数据仓储层接口定义
//!
//! 此模块定义编排引擎持久化层的抽象接口：
//! - 设备仓储接口 (DeviceRepository)
//! - 任务仓储接口 (TaskRepository)
//! - 设备分组仓储接口 (GroupRepository)
//! - 工作流仓储接口 (WorkflowRepository)
//! - 执行记录仓储接口 (ExecutionRepository)
//!
//! ## 并发约定
//!
//! 协议适配器可能以多进程方式运行，因此所有状态迁移都通过 `compare_and_set`
//! 完成：只有当记录的当前状态等于调用方期望的状态时才写入，返回值表示是否写入成功。
//! 内存中的锁只用于减少竞争，不作为正确性的依据。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Device, DeviceGroup, Execution, ExecutionStats, ExecutionStatus, Task, TaskStatus, Workflow,
    WorkflowStatus,
};
use crate::FleetResult;

/// 设备仓储接口
///
/// 设备记录由协议适配器钩子写入，编排引擎其余部分只读。
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get(&self, id: &str) -> FleetResult<Option<Device>>;

    /// 插入或整体替换设备记录
    async fn upsert(&self, device: &Device) -> FleetResult<()>;

    /// 全部设备，按 ID 排序
    async fn list_all(&self) -> FleetResult<Vec<Device>>;

    /// 更新在线状态
    ///
    /// 设备不存在时返回 `DeviceNotFound`。
    async fn set_online(
        &self,
        id: &str,
        online: bool,
        last_contact_at: Option<DateTime<Utc>>,
    ) -> FleetResult<()>;
}

/// 任务仓储接口
///
/// 任务从不被删除；终态任务作为审计历史保留。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建新任务，返回带有数据库生成 ID 的任务
    async fn create(&self, task: &Task) -> FleetResult<Task>;

    async fn get(&self, id: i64) -> FleetResult<Option<Task>>;

    /// 条件更新
    ///
    /// 仅当任务当前状态为 `expected` 时写入 `task` 的所有可变字段。
    /// 返回 `false` 表示状态已被其他参与者修改。
    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> FleetResult<bool>;

    /// 下发认领
    ///
    /// 在同一次写入中检查冲突键：仅当任务仍为 PENDING 且同一设备没有与其冲突的
    /// SENT 任务时，写入 `task` 的 SENT 状态及时间字段。返回 `false` 表示未认领。
    async fn claim_for_delivery(&self, task: &Task) -> FleetResult<bool>;

    /// 设备的所有待下发任务，按创建顺序排列
    async fn pending_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>>;

    /// 设备的所有已下发任务
    async fn sent_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>>;

    /// 截止时间不晚于 `now` 的已下发任务
    async fn expired_sent(&self, now: DateTime<Utc>) -> FleetResult<Vec<Task>>;

    /// 工作流自 `since` 以来创建的任务数量
    async fn count_created_for_workflow_since(
        &self,
        workflow_id: i64,
        since: DateTime<Utc>,
    ) -> FleetResult<u64>;

    /// 设备的任务历史，最新的在前
    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>>;
}

/// 设备分组仓储接口
#[async_trait]
pub trait GroupRepository: Send + Sync {
    /// 创建分组及其规则
    async fn create(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup>;

    /// 更新分组属性并整体替换规则列表
    async fn update(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup>;

    async fn get(&self, id: i64) -> FleetResult<Option<DeviceGroup>>;

    async fn list_all(&self) -> FleetResult<Vec<DeviceGroup>>;
}

/// 工作流仓储接口
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create(&self, workflow: &Workflow) -> FleetResult<Workflow>;

    async fn get(&self, id: i64) -> FleetResult<Option<Workflow>>;

    /// 更新工作流的调度元数据（不包括状态）
    async fn update(&self, workflow: &Workflow) -> FleetResult<()>;

    /// 条件更新状态，返回是否写入成功
    async fn transition_status(
        &self,
        id: i64,
        expected: WorkflowStatus,
        next: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool>;

    async fn list_by_status(&self, status: WorkflowStatus) -> FleetResult<Vec<Workflow>>;

    async fn list_all(&self) -> FleetResult<Vec<Workflow>>;
}

/// 执行记录仓储接口
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 获取或创建 (workflow_id, device_id) 对应的执行记录
    ///
    /// 返回的布尔值表示是否新建。该操作依赖唯一约束保证同一组合最多一条记录。
    async fn get_or_create(&self, execution: &Execution) -> FleetResult<(Execution, bool)>;

    async fn get(&self, id: i64) -> FleetResult<Option<Execution>>;

    async fn find(&self, workflow_id: i64, device_id: &str) -> FleetResult<Option<Execution>>;

    /// 条件更新：仅当当前状态为 `expected` 时写入
    async fn compare_and_set(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> FleetResult<bool>;

    async fn list_for_workflow(&self, workflow_id: i64) -> FleetResult<Vec<Execution>>;

    /// 指定状态的执行记录，按 ID 排序
    async fn list_by_status(
        &self,
        workflow_id: i64,
        status: ExecutionStatus,
    ) -> FleetResult<Vec<Execution>>;

    /// 设备在所有工作流中的执行记录
    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Execution>>;

    /// 按状态聚合的执行记录数量
    async fn stats(&self, workflow_id: i64) -> FleetResult<ExecutionStats>;
}
