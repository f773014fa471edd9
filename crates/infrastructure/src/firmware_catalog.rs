//! 固件目录导入
//!
//! 固件镜像由外部系统上传，运维人员用 TOML 目录文件声明镜像元数据和升级边，
//! 启动时导入数据库：
//!
//! ```text
//! [[images]]
//! device_type = "hgw"
//! version = "V3"
//! download_ref = "https://firmware.example/hgw/V3.bin"
//! size = 33554432
//! active = true
//!
//! [[edges]]
//! device_type = "hgw"
//! from_version = "V2"
//! to_version = "V3"
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use fleet_core::{FirmwareImage, FleetResult, UpgradeEdge};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::SqliteFirmwareRepository;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirmwareCatalog {
    pub images: Vec<FirmwareImage>,
    pub edges: Vec<UpgradeEdge>,
}

impl FirmwareCatalog {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(toml_str).context("解析固件目录失败")?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取固件目录失败: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// 每个设备类型最多一个目标固件
    fn validate(&self) -> Result<()> {
        let mut active_types: Vec<&str> = self
            .images
            .iter()
            .filter(|image| image.active)
            .map(|image| image.device_type.as_str())
            .collect();
        active_types.sort_unstable();
        if let Some(pair) = active_types.windows(2).find(|pair| pair[0] == pair[1]) {
            anyhow::bail!("设备类型 {} 声明了多个目标固件", pair[0]);
        }

        if let Some(edge) = self.edges.iter().find(|e| e.from_version == e.to_version) {
            anyhow::bail!(
                "无效的升级边: {} {} -> {}",
                edge.device_type,
                edge.from_version,
                edge.to_version
            );
        }
        Ok(())
    }

    /// 写入数据库，非目标镜像先于目标镜像写入
    pub async fn apply(&self, repository: &SqliteFirmwareRepository) -> FleetResult<()> {
        let (active, inactive): (Vec<&FirmwareImage>, Vec<&FirmwareImage>) =
            self.images.iter().partition(|image| image.active);
        for image in inactive.into_iter().chain(active) {
            repository.register_image(image).await?;
        }
        for edge in &self.edges {
            repository.add_upgrade_edge(edge).await?;
        }

        info!(
            "固件目录已导入: {} 个镜像, {} 条升级边",
            self.images.len(),
            self.edges.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use fleet_core::FirmwareRepository;
    use std::io::Write;

    const CATALOG: &str = r#"
        [[images]]
        device_type = "hgw"
        version = "V3"
        download_ref = "https://firmware.example/hgw/V3.bin"
        size = 33554432
        active = true

        [[images]]
        device_type = "hgw"
        version = "V2"
        download_ref = "https://firmware.example/hgw/V2.bin"
        size = 31457280
        active = false

        [[edges]]
        device_type = "hgw"
        from_version = "V1"
        to_version = "V2"

        [[edges]]
        device_type = "hgw"
        from_version = "V2"
        to_version = "V3"
    "#;

    #[tokio::test]
    async fn test_catalog_file_is_imported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let catalog = FirmwareCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.images.len(), 2);

        let manager = DatabaseManager::in_memory().await.unwrap();
        let firmware = manager.firmware_repository();
        catalog.apply(&firmware).await.unwrap();

        let active = firmware.active_firmware("hgw").await.unwrap().unwrap();
        assert_eq!(active.version, "V3");
        assert_eq!(firmware.upgrade_path_edges("hgw").await.unwrap().len(), 2);
    }

    #[test]
    fn test_catalog_rejects_two_active_images() {
        let toml = r#"
            [[images]]
            device_type = "hgw"
            version = "V2"
            download_ref = "a"
            size = 1
            active = true

            [[images]]
            device_type = "hgw"
            version = "V3"
            download_ref = "b"
            size = 1
            active = true
        "#;
        assert!(FirmwareCatalog::from_toml(toml).is_err());
    }

    #[test]
    fn test_empty_catalog_is_valid() {
        let catalog = FirmwareCatalog::from_toml("").unwrap();
        assert!(catalog.images.is_empty());
        assert!(catalog.edges.is_empty());
    }
}
