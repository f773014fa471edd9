use async_trait::async_trait;
use fleet_core::{FirmwareImage, FirmwareRepository, FleetError, FleetResult, UpgradeEdge};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::database::mapping::MappingHelpers;

/// 固件元数据仓储
///
/// 镜像二进制由外部固件仓库保存，这里只记录下载引用、目标版本和升级边。
pub struct SqliteFirmwareRepository {
    pool: SqlitePool,
}

impl SqliteFirmwareRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_image(row: &SqliteRow) -> FleetResult<FirmwareImage> {
        Ok(FirmwareImage {
            device_type: row.try_get("device_type")?,
            version: row.try_get("version")?,
            download_ref: row.try_get("download_ref")?,
            size: MappingHelpers::get_u64(row, "size")?,
            active: row.try_get("active")?,
        })
    }

    /// 登记固件镜像
    ///
    /// 标记为 active 的镜像会取代同设备类型的其他目标固件。
    #[instrument(skip(self, image), fields(device_type = %image.device_type, version = %image.version))]
    pub async fn register_image(&self, image: &FirmwareImage) -> FleetResult<()> {
        let size = i64::try_from(image.size).map_err(|_| {
            FleetError::validation_error(format!("固件大小超出范围: {}", image.size))
        })?;
        let mut tx = self.pool.begin().await?;

        if image.active {
            sqlx::query("UPDATE firmware_images SET active = 0 WHERE device_type = ?1")
                .bind(&image.device_type)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO firmware_images (device_type, version, download_ref, size, active)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(device_type, version) DO UPDATE SET
                download_ref = excluded.download_ref,
                size = excluded.size,
                active = excluded.active
            "#,
        )
        .bind(&image.device_type)
        .bind(&image.version)
        .bind(&image.download_ref)
        .bind(size)
        .bind(image.active)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "固件镜像已登记: {} {} (目标固件: {})",
            image.device_type, image.version, image.active
        );
        Ok(())
    }

    /// 声明升级边，重复声明会被忽略
    pub async fn add_upgrade_edge(&self, edge: &UpgradeEdge) -> FleetResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO firmware_upgrade_edges (device_type, from_version, to_version) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(&edge.device_type)
        .bind(&edge.from_version)
        .bind(&edge.to_version)
        .execute(&self.pool)
        .await?;

        debug!(
            "固件升级边: {} {} -> {}",
            edge.device_type, edge.from_version, edge.to_version
        );
        Ok(())
    }
}

#[async_trait]
impl FirmwareRepository for SqliteFirmwareRepository {
    async fn active_firmware(&self, device_type: &str) -> FleetResult<Option<FirmwareImage>> {
        let row = sqlx::query(
            "SELECT device_type, version, download_ref, size, active FROM firmware_images \
             WHERE device_type = ?1 AND active = 1",
        )
        .bind(device_type)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_image).transpose()
    }

    async fn firmware_image(
        &self,
        device_type: &str,
        version: &str,
    ) -> FleetResult<Option<FirmwareImage>> {
        let row = sqlx::query(
            "SELECT device_type, version, download_ref, size, active FROM firmware_images \
             WHERE device_type = ?1 AND version = ?2",
        )
        .bind(device_type)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::row_to_image).transpose()
    }

    async fn upgrade_path_edges(&self, device_type: &str) -> FleetResult<Vec<UpgradeEdge>> {
        let rows = sqlx::query(
            "SELECT device_type, from_version, to_version FROM firmware_upgrade_edges \
             WHERE device_type = ?1 ORDER BY from_version, to_version",
        )
        .bind(device_type)
        .fetch_all(&self.pool)
        .await?;

        let mut edges = Vec::with_capacity(rows.len());
        for row in &rows {
            edges.push(UpgradeEdge {
                device_type: row.try_get("device_type")?,
                from_version: row.try_get("from_version")?,
                to_version: row.try_get("to_version")?,
            });
        }
        Ok(edges)
    }
}
