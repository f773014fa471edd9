use serde::{Deserialize, Serialize};

/// 固件镜像
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirmwareImage {
    pub device_type: String,
    pub version: String,
    /// 设备下载固件使用的引用（URL 或仓库键）
    pub download_ref: String,
    pub size: u64,
    /// 是否为该设备类型当前的目标固件
    pub active: bool,
}

/// 固件升级边：设备可以从 `from_version` 直接升级到 `to_version`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpgradeEdge {
    pub device_type: String,
    pub from_version: String,
    pub to_version: String,
}

impl UpgradeEdge {
    pub fn new(
        device_type: impl Into<String>,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
    ) -> Self {
        Self {
            device_type: device_type.into(),
            from_version: from_version.into(),
            to_version: to_version.into(),
        }
    }
}
