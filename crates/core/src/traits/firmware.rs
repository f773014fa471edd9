use async_trait::async_trait;

use crate::models::{FirmwareImage, UpgradeEdge};
use crate::FleetResult;

/// 固件仓库接口
///
/// 固件二进制的上传和存储由外部系统负责，这里只查询元数据和升级图。
#[async_trait]
pub trait FirmwareRepository: Send + Sync {
    /// 设备类型当前的目标固件
    async fn active_firmware(&self, device_type: &str) -> FleetResult<Option<FirmwareImage>>;

    /// 指定版本的固件镜像
    async fn firmware_image(
        &self,
        device_type: &str,
        version: &str,
    ) -> FleetResult<Option<FirmwareImage>>;

    /// 设备类型声明的全部升级边
    async fn upgrade_path_edges(&self, device_type: &str) -> FleetResult<Vec<UpgradeEdge>>;
}
