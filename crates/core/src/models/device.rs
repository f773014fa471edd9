use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 受管设备
///
/// 设备记录由协议适配器维护，编排引擎只读取它。`attributes` 保存设备上报的参数
/// （例如 `Device.DeviceInfo.HardwareVersion`），供分组规则匹配使用。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub manufacturer: String,
    pub model: String,
    /// 固件仓库使用的设备类型键
    pub device_type: String,
    pub firmware_version: String,
    pub online: bool,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub reachability: ReachabilityHints,
    /// Mesh 拓扑中的上级设备
    pub parent_device_id: Option<String>,
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 设备可达性提示
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReachabilityHints {
    /// 设备公布的连接请求地址
    pub connection_request_url: Option<String>,
    /// NAT 后设备注册的 UDP 汇合地址
    pub udp_rendezvous_addr: Option<String>,
    /// 持久会话通道（XMPP）身份
    pub xmpp_jid: Option<String>,
    /// 设备是否需要 STUN/NAT 穿透
    pub stun_enabled: bool,
}

/// 唤醒策略类型，按优先级排列
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WakeStrategyKind {
    DirectCallback,
    UdpRendezvous,
    PresenceWake,
}

text_enum!(WakeStrategyKind, "唤醒策略" {
    DirectCallback => "DIRECT_CALLBACK",
    UdpRendezvous => "UDP_RENDEZVOUS",
    PresenceWake => "PRESENCE_WAKE",
});

impl WakeStrategyKind {
    /// 偏好顺序，数值越小越优先
    pub fn preference(&self) -> u8 {
        match self {
            WakeStrategyKind::DirectCallback => 0,
            WakeStrategyKind::UdpRendezvous => 1,
            WakeStrategyKind::PresenceWake => 2,
        }
    }

    /// 根据设备的可达性提示判断策略是否适用
    ///
    /// 直接回调要求设备公布了地址且不需要 NAT 穿透；UDP 汇合要求设备位于 NAT 之后
    /// 并已注册汇合地址；presence 唤醒只要求设备维持持久会话通道。
    pub fn applies_to(&self, device: &Device) -> bool {
        match self {
            WakeStrategyKind::DirectCallback => {
                device.has_direct_address() && !device.reachability.stun_enabled
            }
            WakeStrategyKind::UdpRendezvous => {
                device.reachability.stun_enabled && device.has_rendezvous_address()
            }
            WakeStrategyKind::PresenceWake => device.has_presence_channel(),
        }
    }
}

/// 规则匹配使用的扁平化设备属性快照
pub type DeviceSnapshot = BTreeMap<String, Value>;

/// 内置字段名称
pub const BUILTIN_FIELDS: &[&str] = &[
    "id",
    "manufacturer",
    "model",
    "device_type",
    "firmware_version",
    "online",
    "last_contact_at",
    "parent_device_id",
    "connection_request_url",
    "udp_rendezvous_addr",
    "xmpp_jid",
    "stun_enabled",
];

/// 自定义属性的字段前缀
pub const ATTRIBUTE_PREFIX: &str = "attributes.";

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            manufacturer: String::new(),
            model: String::new(),
            device_type: String::new(),
            firmware_version: String::new(),
            online: false,
            last_contact_at: None,
            reachability: ReachabilityHints::default(),
            parent_device_id: None,
            attributes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 构建规则匹配使用的属性快照
    ///
    /// 空字符串和缺失的可选字段以 `Null` 表示，规则匹配器将其视为字段缺失。
    pub fn snapshot(&self) -> DeviceSnapshot {
        let mut snapshot = DeviceSnapshot::new();
        snapshot.insert("id".to_string(), Value::String(self.id.clone()));
        snapshot.insert("manufacturer".to_string(), non_empty(&self.manufacturer));
        snapshot.insert("model".to_string(), non_empty(&self.model));
        snapshot.insert("device_type".to_string(), non_empty(&self.device_type));
        snapshot.insert(
            "firmware_version".to_string(),
            non_empty(&self.firmware_version),
        );
        snapshot.insert("online".to_string(), Value::Bool(self.online));
        snapshot.insert(
            "last_contact_at".to_string(),
            self.last_contact_at
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        snapshot.insert(
            "parent_device_id".to_string(),
            optional(&self.parent_device_id),
        );
        snapshot.insert(
            "connection_request_url".to_string(),
            optional(&self.reachability.connection_request_url),
        );
        snapshot.insert(
            "udp_rendezvous_addr".to_string(),
            optional(&self.reachability.udp_rendezvous_addr),
        );
        snapshot.insert("xmpp_jid".to_string(), optional(&self.reachability.xmpp_jid));
        snapshot.insert(
            "stun_enabled".to_string(),
            Value::Bool(self.reachability.stun_enabled),
        );

        for (key, value) in &self.attributes {
            snapshot.insert(format!("{ATTRIBUTE_PREFIX}{key}"), value.clone());
            if !snapshot.contains_key(key) {
                snapshot.insert(key.clone(), value.clone());
            }
        }

        snapshot
    }

    /// 合并协议适配器上报的属性，返回发生变化的字段名
    ///
    /// 已知键更新内置字段，其余键写入 `attributes`。
    pub fn apply_report(&mut self, report: &BTreeMap<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();

        for (key, value) in report {
            let updated = match key.as_str() {
                "manufacturer" => assign_string(&mut self.manufacturer, value),
                "model" => assign_string(&mut self.model, value),
                "device_type" => assign_string(&mut self.device_type, value),
                "firmware_version" => assign_string(&mut self.firmware_version, value),
                "parent_device_id" => assign_optional(&mut self.parent_device_id, value),
                "connection_request_url" => {
                    assign_optional(&mut self.reachability.connection_request_url, value)
                }
                "udp_rendezvous_addr" => {
                    assign_optional(&mut self.reachability.udp_rendezvous_addr, value)
                }
                "xmpp_jid" => assign_optional(&mut self.reachability.xmpp_jid, value),
                "stun_enabled" => {
                    let flag = value.as_bool().unwrap_or(false);
                    let changed = self.reachability.stun_enabled != flag;
                    self.reachability.stun_enabled = flag;
                    changed
                }
                _ => {
                    let previous = self.attributes.insert(key.clone(), value.clone());
                    previous.as_ref() != Some(value)
                }
            };

            if updated {
                changed.push(key.clone());
            }
        }

        changed
    }

    pub fn has_direct_address(&self) -> bool {
        self.reachability
            .connection_request_url
            .as_deref()
            .is_some_and(|url| !url.is_empty())
    }

    pub fn has_rendezvous_address(&self) -> bool {
        self.reachability
            .udp_rendezvous_addr
            .as_deref()
            .is_some_and(|addr| !addr.is_empty())
    }

    pub fn has_presence_channel(&self) -> bool {
        self.reachability
            .xmpp_jid
            .as_deref()
            .is_some_and(|jid| !jid.is_empty())
    }
}

fn non_empty(value: &str) -> Value {
    if value.is_empty() {
        Value::Null
    } else {
        Value::String(value.to_string())
    }
}

fn optional(value: &Option<String>) -> Value {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Value::String(v.to_string()),
        _ => Value::Null,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn assign_string(target: &mut String, value: &Value) -> bool {
    let next = value_to_string(value).unwrap_or_default();
    if *target == next {
        return false;
    }
    *target = next;
    true
}

fn assign_optional(target: &mut Option<String>, value: &Value) -> bool {
    let next = value_to_string(value).filter(|s| !s.is_empty());
    if *target == next {
        return false;
    }
    *target = next;
    true
}
