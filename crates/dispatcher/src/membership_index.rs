use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fleet_core::{
    traits::{DeviceRepository, GroupRepository},
    Device, DeviceGroup, FleetError, FleetResult, MatchType, Rule, StructuredLogger,
};

use crate::rule_matcher::CompiledGroup;

/// 设备加入和离开的分组
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub joined: Vec<i64>,
    pub left: Vec<i64>,
}

impl MembershipDelta {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

struct IndexedGroup {
    group: DeviceGroup,
    /// 规则无法编译的分组没有成员
    compiled: Option<CompiledGroup>,
}

impl IndexedGroup {
    fn new(group: DeviceGroup) -> Self {
        let compiled = if group.active {
            match CompiledGroup::from_group(&group) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!("分组 {} ({}) 的规则无效，视为没有成员: {}", group.id, group.name, e);
                    None
                }
            }
        } else {
            None
        };
        Self { group, compiled }
    }

    fn matches(&self, device: &Device) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|compiled| compiled.matches(&device.snapshot()))
    }

    fn references_any(&self, fields: &[String]) -> bool {
        self.compiled.as_ref().is_some_and(|compiled| {
            compiled
                .referenced_fields()
                .any(|field| fields.iter().any(|changed| field_matches(field, changed)))
        })
    }
}

/// 规则字段与上报字段是否指向同一属性
fn field_matches(rule_field: &str, changed: &str) -> bool {
    rule_field == changed
        || rule_field
            .strip_prefix(fleet_core::models::device::ATTRIBUTE_PREFIX)
            .is_some_and(|name| name == changed)
}

#[derive(Default)]
struct MembershipState {
    groups: HashMap<i64, IndexedGroup>,
    members: HashMap<i64, BTreeSet<String>>,
    device_groups: HashMap<String, BTreeSet<i64>>,
}

impl MembershipState {
    fn set_membership(&mut self, device_id: &str, group_id: i64, is_member: bool) -> bool {
        if is_member {
            let inserted = self
                .members
                .entry(group_id)
                .or_default()
                .insert(device_id.to_string());
            self.device_groups
                .entry(device_id.to_string())
                .or_default()
                .insert(group_id);
            inserted
        } else {
            let removed = self
                .members
                .get_mut(&group_id)
                .is_some_and(|members| members.remove(device_id));
            if let Some(groups) = self.device_groups.get_mut(device_id) {
                groups.remove(&group_id);
            }
            removed
        }
    }
}

/// 动态分组成员索引
///
/// 缓存每个分组的成员和每个设备所属的分组。缓存在以下时机更新：
/// - 设备上报的属性变化涉及某个分组引用的字段（`on_device_changed`）
/// - 分组或规则被编辑（`on_group_changed`）
/// - 周期性全量重建（`rebuild`）
///
/// 查询结果最多落后一个重建周期；设备连接时调度器使用 `matches_now` 做实时确认。
pub struct MembershipIndex {
    device_repo: Arc<dyn DeviceRepository>,
    group_repo: Arc<dyn GroupRepository>,
    state: RwLock<MembershipState>,
}

impl MembershipIndex {
    pub fn new(device_repo: Arc<dyn DeviceRepository>, group_repo: Arc<dyn GroupRepository>) -> Self {
        Self {
            device_repo,
            group_repo,
            state: RwLock::new(MembershipState::default()),
        }
    }

    /// 全量重建索引
    pub async fn rebuild(&self) -> FleetResult<()> {
        let groups = self.group_repo.list_all().await?;
        let devices = self.device_repo.list_all().await?;

        let mut next = MembershipState::default();
        for device in &devices {
            next.device_groups.entry(device.id.clone()).or_default();
        }
        for group in groups {
            let indexed = IndexedGroup::new(group);
            let group_id = indexed.group.id;
            next.members.entry(group_id).or_default();
            for device in &devices {
                if indexed.matches(device) {
                    next.set_membership(&device.id, group_id, true);
                }
            }
            next.groups.insert(group_id, indexed);
        }

        let group_count = next.groups.len();
        *self.state.write().await = next;

        info!(
            "分组成员索引已重建: {} 个分组, {} 台设备",
            group_count,
            devices.len()
        );
        Ok(())
    }

    /// 设备属性变化后增量更新
    ///
    /// `changed_fields` 为 `None` 表示未知变化（例如设备首次出现），会对所有分组重新求值；
    /// 否则只有当变化的字段被某个分组引用时才重新求值。
    pub async fn on_device_changed(
        &self,
        device: &Device,
        changed_fields: Option<&[String]>,
    ) -> MembershipDelta {
        let mut state = self.state.write().await;
        let known = state.device_groups.contains_key(&device.id);

        if let (true, Some(fields)) = (known, changed_fields) {
            if !state.groups.values().any(|g| g.references_any(fields)) {
                debug!("设备 {} 的属性变化与任何分组规则无关", device.id);
                return MembershipDelta::default();
            }
        }

        let evaluations: Vec<(i64, bool)> = state
            .groups
            .iter()
            .map(|(id, indexed)| (*id, indexed.matches(device)))
            .collect();

        let mut delta = MembershipDelta::default();
        for (group_id, is_member) in evaluations {
            let was_member = state
                .members
                .get(&group_id)
                .is_some_and(|members| members.contains(&device.id));
            if was_member != is_member {
                state.set_membership(&device.id, group_id, is_member);
                if is_member {
                    delta.joined.push(group_id);
                } else {
                    delta.left.push(group_id);
                }
            }
        }
        state.device_groups.entry(device.id.clone()).or_default();

        delta.joined.sort_unstable();
        delta.left.sort_unstable();
        if !delta.is_empty() {
            StructuredLogger::log_membership_changed(&device.id, &delta.joined, &delta.left);
        }
        delta
    }

    /// 分组或规则被编辑后重新计算该分组的成员
    pub async fn on_group_changed(&self, group_id: i64) -> FleetResult<()> {
        let group = self.group_repo.get(group_id).await?;
        let devices = self.device_repo.list_all().await?;

        let mut state = self.state.write().await;
        let previous: Vec<String> = state
            .members
            .get(&group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        for device_id in previous {
            state.set_membership(&device_id, group_id, false);
        }

        match group {
            Some(group) => {
                let indexed = IndexedGroup::new(group);
                state.members.entry(group_id).or_default();
                for device in &devices {
                    if indexed.matches(device) {
                        state.set_membership(&device.id, group_id, true);
                    }
                }
                debug!(
                    "分组 {} 成员已重新计算: {} 台设备",
                    group_id,
                    state.members.get(&group_id).map_or(0, |m| m.len())
                );
                state.groups.insert(group_id, indexed);
            }
            None => {
                state.groups.remove(&group_id);
                state.members.remove(&group_id);
            }
        }

        Ok(())
    }

    /// 分组当前的成员设备 ID
    pub async fn members_of(&self, group_id: i64) -> Vec<String> {
        self.state
            .read()
            .await
            .members
            .get(&group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 设备当前匹配的分组，按优先级从高到低排列
    pub async fn groups_of(&self, device_id: &str) -> Vec<DeviceGroup> {
        let state = self.state.read().await;
        let mut groups: Vec<DeviceGroup> = state
            .device_groups
            .get(device_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.groups.get(id))
                    .map(|indexed| indexed.group.clone())
                    .collect()
            })
            .unwrap_or_default();
        groups.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        groups
    }

    pub async fn is_member(&self, group_id: i64, device_id: &str) -> bool {
        self.state
            .read()
            .await
            .members
            .get(&group_id)
            .is_some_and(|members| members.contains(device_id))
    }

    /// 从仓储读取最新的分组定义并立即求值
    pub async fn matches_now(&self, device: &Device, group_id: i64) -> FleetResult<bool> {
        let group = self
            .group_repo
            .get(group_id)
            .await?
            .ok_or(FleetError::GroupNotFound { id: group_id })?;
        if !group.active {
            return Ok(false);
        }
        Ok(CompiledGroup::from_group(&group)?.matches(&device.snapshot()))
    }

    /// 预览尚未保存的规则会匹配哪些设备
    pub async fn preview(&self, match_type: MatchType, rules: &[Rule]) -> FleetResult<Vec<String>> {
        let compiled = CompiledGroup::compile(match_type, rules)?;
        let devices = self.device_repo.list_all().await?;
        Ok(devices
            .iter()
            .filter(|device| compiled.matches(&device.snapshot()))
            .map(|device| device.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::RuleOperator;
    use fleet_testing_utils::{DeviceBuilder, MockDeviceRepository, MockGroupRepository};
    use serde_json::json;
    use std::collections::BTreeMap;

    async fn setup() -> (Arc<MockDeviceRepository>, Arc<MockGroupRepository>, MembershipIndex) {
        let device_repo = Arc::new(MockDeviceRepository::new());
        let group_repo = Arc::new(MockGroupRepository::new());
        let index = MembershipIndex::new(device_repo.clone(), group_repo.clone());
        (device_repo, group_repo, index)
    }

    fn model_group(name: &str, model: &str, priority: i32) -> DeviceGroup {
        DeviceGroup::new(name, MatchType::All)
            .with_priority(priority)
            .with_rule(Rule::new("model", RuleOperator::Equals, Some(model)))
    }

    #[tokio::test]
    async fn test_rebuild_and_queries() {
        let (device_repo, group_repo, index) = setup().await;
        device_repo.upsert(&DeviceBuilder::new("A").with_model("X1").build()).await.unwrap();
        device_repo.upsert(&DeviceBuilder::new("B").with_model("X2").build()).await.unwrap();

        let low = group_repo.create(&model_group("low", "X1", 1)).await.unwrap();
        let high = group_repo
            .create(
                &DeviceGroup::new("high", MatchType::Any)
                    .with_priority(10)
                    .with_rule(Rule::new("model", RuleOperator::StartsWith, Some("X"))),
            )
            .await
            .unwrap();

        index.rebuild().await.unwrap();

        assert_eq!(index.members_of(low.id).await, vec!["A".to_string()]);
        assert_eq!(
            index.members_of(high.id).await,
            vec!["A".to_string(), "B".to_string()]
        );

        let groups: Vec<i64> = index.groups_of("A").await.iter().map(|g| g.id).collect();
        assert_eq!(groups, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn test_device_change_reports_delta() {
        let (device_repo, group_repo, index) = setup().await;
        let mut device = DeviceBuilder::new("A").with_model("X1").build();
        device_repo.upsert(&device).await.unwrap();
        let group = group_repo.create(&model_group("x2", "X2", 0)).await.unwrap();
        index.rebuild().await.unwrap();
        assert!(index.members_of(group.id).await.is_empty());

        let mut report = BTreeMap::new();
        report.insert("model".to_string(), json!("X2"));
        let changed = device.apply_report(&report);
        let delta = index.on_device_changed(&device, Some(&changed)).await;
        assert_eq!(delta.joined, vec![group.id]);
        assert!(index.is_member(group.id, "A").await);

        // 与规则无关的字段变化不会触发重新求值
        report.clear();
        report.insert("Device.WiFi.SSID".to_string(), json!("home"));
        let changed = device.apply_report(&report);
        assert!(index.on_device_changed(&device, Some(&changed)).await.is_empty());
    }

    #[tokio::test]
    async fn test_group_edit_recomputes_members() {
        let (device_repo, group_repo, index) = setup().await;
        device_repo.upsert(&DeviceBuilder::new("A").with_model("X1").build()).await.unwrap();
        let mut group = group_repo.create(&model_group("g", "X1", 0)).await.unwrap();
        index.rebuild().await.unwrap();
        assert!(index.is_member(group.id, "A").await);

        group.rules[0].value = Some("X9".to_string());
        group_repo.update(&group).await.unwrap();
        index.on_group_changed(group.id).await.unwrap();
        assert!(!index.is_member(group.id, "A").await);
        assert!(index.groups_of("A").await.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_and_invalid_groups_have_no_members() {
        let (device_repo, group_repo, index) = setup().await;
        device_repo.upsert(&DeviceBuilder::new("A").with_model("X1").build()).await.unwrap();

        let mut inactive = model_group("inactive", "X1", 0);
        inactive.active = false;
        let inactive = group_repo.create(&inactive).await.unwrap();
        let invalid = group_repo
            .create(
                &DeviceGroup::new("invalid", MatchType::All)
                    .with_rule(Rule::new("model", RuleOperator::Regex, Some("X("))),
            )
            .await
            .unwrap();

        index.rebuild().await.unwrap();
        assert!(index.members_of(inactive.id).await.is_empty());
        assert!(index.members_of(invalid.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_preview_and_matches_now() {
        let (device_repo, group_repo, index) = setup().await;
        let device = DeviceBuilder::new("A").with_model("X1").build();
        device_repo.upsert(&device).await.unwrap();
        device_repo.upsert(&DeviceBuilder::new("B").with_model("Y1").build()).await.unwrap();

        let preview = index
            .preview(
                MatchType::All,
                &[Rule::new("model", RuleOperator::In, Some(r#"["X1","Z1"]"#))],
            )
            .await
            .unwrap();
        assert_eq!(preview, vec!["A".to_string()]);

        let err = index
            .preview(MatchType::All, &[Rule::new("colour", RuleOperator::IsNull, None)])
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownField(_)));

        let group = group_repo.create(&model_group("g", "X1", 0)).await.unwrap();
        // 索引尚未重建，实时检查仍然返回最新结果
        assert!(!index.is_member(group.id, "A").await);
        assert!(index.matches_now(&device, group.id).await.unwrap());
    }
}
