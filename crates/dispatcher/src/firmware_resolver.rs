use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use fleet_core::{traits::FirmwareRepository, FirmwareImage, FleetError, FleetResult, UpgradeEdge};

/// 固件升级计划
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePlan {
    pub device_type: String,
    pub current_version: String,
    pub target: FirmwareImage,
    /// 依次需要安装的固件，最后一项为目标固件；已是目标版本时为空
    pub hops: Vec<FirmwareImage>,
}

impl FirmwarePlan {
    pub fn is_up_to_date(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn next_hop(&self) -> Option<&FirmwareImage> {
        self.hops.first()
    }

    pub fn hop_versions(&self) -> Vec<String> {
        self.hops.iter().map(|hop| hop.version.clone()).collect()
    }
}

/// 在升级图上求从 `current` 到 `target` 的最短路径
///
/// 邻居按版本字符串排序后访问，相同输入总是返回相同结果。返回值不包含 `current`；
/// `current == target` 时返回空列表，不可达时返回 `None`。
pub fn shortest_upgrade_path(
    edges: &[UpgradeEdge],
    current: &str,
    target: &str,
) -> Option<Vec<String>> {
    if current == target {
        return Some(Vec::new());
    }

    let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for edge in edges {
        graph
            .entry(edge.from_version.as_str())
            .or_default()
            .insert(edge.to_version.as_str());
    }

    let mut parents: HashMap<&str, &str> = HashMap::new();
    let mut queue = VecDeque::new();
    queue.push_back(current);

    while let Some(version) = queue.pop_front() {
        let Some(neighbours) = graph.get(version) else {
            continue;
        };
        for &next in neighbours {
            if next == current || parents.contains_key(next) {
                continue;
            }
            parents.insert(next, version);
            if next == target {
                let mut path = vec![target.to_string()];
                let mut cursor = target;
                while let Some(&parent) = parents.get(cursor) {
                    if parent == current {
                        break;
                    }
                    path.push(parent.to_string());
                    cursor = parent;
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(next);
        }
    }

    None
}

/// 固件升级路径解析器
///
/// 每次设备上报新版本后重新解析，而不是一次性计算后按顺序回放。
pub struct FirmwarePathResolver {
    firmware_repo: Arc<dyn FirmwareRepository>,
}

impl FirmwarePathResolver {
    pub fn new(firmware_repo: Arc<dyn FirmwareRepository>) -> Self {
        Self { firmware_repo }
    }

    /// 解析升级所需的版本序列
    ///
    /// 设备类型没有声明任何升级边时，只有当前版本是该类型已登记的固件才允许
    /// 直接升级到目标版本。
    pub async fn resolve_versions(
        &self,
        device_type: &str,
        current: &str,
        target: &str,
    ) -> FleetResult<Vec<String>> {
        if current == target {
            return Ok(Vec::new());
        }

        let path_not_found = || FleetError::FirmwarePathNotFound {
            device_type: device_type.to_string(),
            from: current.to_string(),
            to: target.to_string(),
        };

        let edges = self.firmware_repo.upgrade_path_edges(device_type).await?;
        if edges.is_empty() {
            if self
                .firmware_repo
                .firmware_image(device_type, current)
                .await?
                .is_none()
            {
                debug!("设备类型 {} 的当前版本 {} 未登记", device_type, current);
                return Err(path_not_found());
            }
            debug!("设备类型 {} 没有声明升级路径，直接升级到 {}", device_type, target);
            return Ok(vec![target.to_string()]);
        }

        shortest_upgrade_path(&edges, current, target).ok_or_else(path_not_found)
    }

    /// 生成完整的升级计划
    ///
    /// `target_version` 为 `None` 时使用设备类型当前的目标固件。
    pub async fn plan(
        &self,
        device_type: &str,
        current: &str,
        target_version: Option<&str>,
    ) -> FleetResult<FirmwarePlan> {
        let target = match target_version {
            Some(version) => self.image(device_type, version).await?,
            None => self
                .firmware_repo
                .active_firmware(device_type)
                .await?
                .ok_or_else(|| FleetError::FirmwareNotFound {
                    device_type: device_type.to_string(),
                    version: "active".to_string(),
                })?,
        };

        let versions = self
            .resolve_versions(device_type, current, &target.version)
            .await?;

        let mut hops = Vec::with_capacity(versions.len());
        for version in &versions {
            if *version == target.version {
                hops.push(target.clone());
            } else {
                hops.push(self.image(device_type, version).await?);
            }
        }

        debug!(
            "设备类型 {} 从 {} 升级到 {} 的路径: {:?}",
            device_type, current, target.version, versions
        );

        Ok(FirmwarePlan {
            device_type: device_type.to_string(),
            current_version: current.to_string(),
            target,
            hops,
        })
    }

    async fn image(&self, device_type: &str, version: &str) -> FleetResult<FirmwareImage> {
        self.firmware_repo
            .firmware_image(device_type, version)
            .await?
            .ok_or_else(|| FleetError::FirmwareNotFound {
                device_type: device_type.to_string(),
                version: version.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_testing_utils::MockFirmwareRepository;

    fn edges(pairs: &[(&str, &str)]) -> Vec<UpgradeEdge> {
        pairs
            .iter()
            .map(|(from, to)| UpgradeEdge::new("hgw", *from, *to))
            .collect()
    }

    #[test]
    fn test_shortest_path_prefers_fewest_hops() {
        let graph = edges(&[("V1", "V2"), ("V2", "V3"), ("V1", "V1.5"), ("V1.5", "V2")]);
        assert_eq!(
            shortest_upgrade_path(&graph, "V1", "V3"),
            Some(vec!["V2".to_string(), "V3".to_string()])
        );
        assert_eq!(
            shortest_upgrade_path(&graph, "V2", "V3"),
            Some(vec!["V3".to_string()])
        );
        assert_eq!(shortest_upgrade_path(&graph, "V3", "V3"), Some(vec![]));
        assert_eq!(shortest_upgrade_path(&graph, "V0", "V3"), None);
    }

    #[test]
    fn test_equal_length_paths_resolve_deterministically() {
        let graph = edges(&[("A", "C"), ("A", "B"), ("B", "D"), ("C", "D")]);
        let first = shortest_upgrade_path(&graph, "A", "D");
        assert_eq!(first, Some(vec!["B".to_string(), "D".to_string()]));
        for _ in 0..10 {
            assert_eq!(shortest_upgrade_path(&graph, "A", "D"), first);
        }
    }

    #[test]
    fn test_cycles_do_not_loop() {
        let graph = edges(&[("A", "B"), ("B", "A"), ("B", "C")]);
        assert_eq!(
            shortest_upgrade_path(&graph, "A", "C"),
            Some(vec!["B".to_string(), "C".to_string()])
        );
        assert_eq!(shortest_upgrade_path(&graph, "A", "Z"), None);
    }

    #[tokio::test]
    async fn test_v1_v2_v3_scenario() {
        let repo = Arc::new(MockFirmwareRepository::new());
        repo.add_image("hgw", "V2", false);
        repo.add_image("hgw", "V3", true);
        repo.add_edge("hgw", "V1", "V2");
        repo.add_edge("hgw", "V2", "V3");
        let resolver = FirmwarePathResolver::new(repo);

        let plan = resolver.plan("hgw", "V1", None).await.unwrap();
        assert_eq!(plan.hop_versions(), vec!["V2", "V3"]);
        assert_eq!(plan.next_hop().map(|hop| hop.version.as_str()), Some("V2"));

        // 幂等：状态不变时重复解析结果相同
        let again = resolver.plan("hgw", "V1", None).await.unwrap();
        assert_eq!(plan, again);

        // 设备上报 V2 后重新解析
        let plan = resolver.plan("hgw", "V2", None).await.unwrap();
        assert_eq!(plan.hop_versions(), vec!["V3"]);

        let plan = resolver.plan("hgw", "V3", None).await.unwrap();
        assert!(plan.is_up_to_date());
    }

    #[tokio::test]
    async fn test_unknown_current_version_is_reportable_error() {
        let repo = Arc::new(MockFirmwareRepository::new());
        repo.add_image("hgw", "V3", true);
        repo.add_edge("hgw", "V2", "V3");
        let resolver = FirmwarePathResolver::new(repo);

        let err = resolver.plan("hgw", "V0", None).await.unwrap_err();
        assert!(matches!(err, FleetError::FirmwarePathNotFound { ref from, .. } if from == "V0"));
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_direct_upgrade_without_declared_edges() {
        let repo = Arc::new(MockFirmwareRepository::new());
        repo.add_image("ont", "1.0", false);
        repo.add_image("ont", "2.0", true);
        let resolver = FirmwarePathResolver::new(repo);

        let plan = resolver.plan("ont", "1.0", None).await.unwrap();
        assert_eq!(plan.hop_versions(), vec!["2.0"]);
    }

    #[tokio::test]
    async fn test_unregistered_current_version_without_edges_is_rejected() {
        let repo = Arc::new(MockFirmwareRepository::new());
        repo.add_image("ont", "2.0", true);
        let resolver = FirmwarePathResolver::new(repo);

        let err = resolver.plan("ont", "0.9-beta", None).await.unwrap_err();
        assert!(
            matches!(err, FleetError::FirmwarePathNotFound { ref from, .. } if from == "0.9-beta")
        );
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_missing_active_firmware() {
        let repo = Arc::new(MockFirmwareRepository::new());
        let resolver = FirmwarePathResolver::new(repo);
        let err = resolver.plan("ont", "1.0", None).await.unwrap_err();
        assert!(matches!(err, FleetError::FirmwareNotFound { .. }));
    }
}
