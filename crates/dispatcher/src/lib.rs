//! 工作流调度与任务分发
//!
//! 叶子组件在前：规则匹配 → 分组成员索引 → 固件升级路径解析 → 任务状态机 →
//! 设备唤醒分发 → 工作流调度器。`FleetController` 是协议适配器和管理控制台的统一入口。

pub mod connection_dispatcher;
pub mod controller;
pub mod cron_utils;
pub mod dependency_checker;
pub mod firmware_resolver;
pub mod membership_index;
pub mod retry_policy;
pub mod rule_matcher;
pub mod scheduler;
pub mod state_listener;
pub mod task_state_machine;
pub mod timeout_sweeper;

pub use connection_dispatcher::{ConnectionDispatcher, DispatchOutcome, WakeAttempt};
pub use controller::{ConnectOutcome, FleetController};
pub use firmware_resolver::{FirmwarePathResolver, FirmwarePlan};
pub use membership_index::{MembershipDelta, MembershipIndex};
pub use scheduler::{SchedulerRepositories, SchedulerTrigger, WorkflowScheduler};
pub use state_listener::StateListener;
pub use task_state_machine::{ReportOutcome, SweepReport, TaskReport, TaskStateMachine};
pub use timeout_sweeper::TimeoutSweeper;
