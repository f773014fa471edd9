//! 测试数据构建器

use chrono::{DateTime, Utc};
use serde_json::Value;

use fleet_core::{
    Device, DeviceGroup, MatchType, Rule, RuleOperator, ScheduleMode, TaskKind, Workflow,
    WorkflowStatus,
};

/// 设备构建器，默认离线、没有任何可达性提示
pub struct DeviceBuilder {
    device: Device,
}

impl DeviceBuilder {
    pub fn new(id: &str) -> Self {
        let mut device = Device::new(id);
        device.manufacturer = "Acme".to_string();
        device.device_type = "hgw".to_string();
        Self { device }
    }

    pub fn online(mut self) -> Self {
        self.device.online = true;
        self.device.last_contact_at = Some(Utc::now());
        self
    }

    pub fn with_manufacturer(mut self, manufacturer: &str) -> Self {
        self.device.manufacturer = manufacturer.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.device.model = model.to_string();
        self
    }

    pub fn with_device_type(mut self, device_type: &str) -> Self {
        self.device.device_type = device_type.to_string();
        self
    }

    pub fn with_firmware(mut self, version: &str) -> Self {
        self.device.firmware_version = version.to_string();
        self
    }

    pub fn with_connection_request_url(mut self, url: &str) -> Self {
        self.device.reachability.connection_request_url = Some(url.to_string());
        self
    }

    /// 设备位于 NAT 之后并注册了 UDP 汇合地址
    pub fn with_udp_rendezvous(mut self, addr: &str) -> Self {
        self.device.reachability.stun_enabled = true;
        self.device.reachability.udp_rendezvous_addr = Some(addr.to_string());
        self
    }

    pub fn with_stun(mut self) -> Self {
        self.device.reachability.stun_enabled = true;
        self
    }

    pub fn with_xmpp_jid(mut self, jid: &str) -> Self {
        self.device.reachability.xmpp_jid = Some(jid.to_string());
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.device.parent_device_id = Some(parent_id.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.device.attributes.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Device {
        self.device
    }
}

/// 分组构建器
pub struct GroupBuilder {
    group: DeviceGroup,
}

impl GroupBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            group: DeviceGroup::new(name, MatchType::All),
        }
    }

    pub fn match_any(mut self) -> Self {
        self.group.match_type = MatchType::Any;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.group.priority = priority;
        self
    }

    pub fn with_rule(mut self, field: &str, operator: RuleOperator, value: Option<&str>) -> Self {
        self.group = self.group.with_rule(Rule::new(field, operator, value));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.group.active = false;
        self
    }

    pub fn build(self) -> DeviceGroup {
        self.group
    }
}

/// 工作流构建器，默认立即执行、不限速、不熔断
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn new(name: &str, group_id: i64) -> Self {
        Self {
            workflow: Workflow::new(name, group_id, TaskKind::Reboot, Value::Object(Default::default())),
        }
    }

    pub fn with_task(mut self, kind: TaskKind, parameters: Value) -> Self {
        self.workflow.task_kind = kind;
        self.workflow.parameters = parameters;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.workflow.schedule_mode = ScheduleMode::Scheduled;
        self.workflow.scheduled_at = Some(at);
        self
    }

    pub fn recurring(mut self, cron_expression: &str) -> Self {
        self.workflow.schedule_mode = ScheduleMode::Recurring;
        self.workflow.cron_expression = Some(cron_expression.to_string());
        self
    }

    pub fn on_connect(mut self) -> Self {
        self.workflow.schedule_mode = ScheduleMode::OnConnect;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.workflow.max_concurrent = max_concurrent;
        self
    }

    pub fn with_rate_limit(mut self, per_hour: u32) -> Self {
        self.workflow.rate_limit = per_hour;
        self
    }

    pub fn with_retries(mut self, retry_count: u32, delay_minutes: u32) -> Self {
        self.workflow.retry_count = retry_count;
        self.workflow.retry_delay_minutes = delay_minutes;
        self
    }

    pub fn stop_on_failure_percent(mut self, percent: u32) -> Self {
        self.workflow.stop_on_failure_percent = percent;
        self
    }

    pub fn depends_on(mut self, workflow_id: i64) -> Self {
        self.workflow.depends_on_workflow_id = Some(workflow_id);
        self
    }

    pub fn repeat_per_device(mut self) -> Self {
        self.workflow.run_once_per_device = false;
        self
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.workflow.status = status;
        self
    }

    pub fn active(self) -> Self {
        self.with_status(WorkflowStatus::Active)
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}
