use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{Device, DeviceRepository, FleetError, FleetResult, ReachabilityHints};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const DEVICE_COLUMNS: &str = "id, manufacturer, model, device_type, firmware_version, online, \
     last_contact_at, connection_request_url, udp_rendezvous_addr, xmpp_jid, stun_enabled, \
     parent_device_id, attributes, created_at, updated_at";

pub struct SqliteDeviceRepository {
    pool: SqlitePool,
}

impl SqliteDeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_device(row: &SqliteRow) -> FleetResult<Device> {
        Ok(Device {
            id: row.try_get("id")?,
            manufacturer: row.try_get("manufacturer")?,
            model: row.try_get("model")?,
            device_type: row.try_get("device_type")?,
            firmware_version: row.try_get("firmware_version")?,
            online: row.try_get("online")?,
            last_contact_at: row.try_get("last_contact_at")?,
            reachability: ReachabilityHints {
                connection_request_url: row.try_get("connection_request_url")?,
                udp_rendezvous_addr: row.try_get("udp_rendezvous_addr")?,
                xmpp_jid: row.try_get("xmpp_jid")?,
                stun_enabled: row.try_get("stun_enabled")?,
            },
            parent_device_id: row.try_get("parent_device_id")?,
            attributes: MappingHelpers::parse_json(row, "attributes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl DeviceRepository for SqliteDeviceRepository {
    #[instrument(skip(self), fields(device_id = %id))]
    async fn get(&self, id: &str) -> FleetResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_device).transpose()
    }

    #[instrument(skip(self, device), fields(device_id = %device.id))]
    async fn upsert(&self, device: &Device) -> FleetResult<()> {
        let attributes = MappingHelpers::to_json_text(&device.attributes)?;

        sqlx::query(
            r#"
            INSERT INTO devices (id, manufacturer, model, device_type, firmware_version, online,
                last_contact_at, connection_request_url, udp_rendezvous_addr, xmpp_jid,
                stun_enabled, parent_device_id, attributes, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            ON CONFLICT(id) DO UPDATE SET
                manufacturer = excluded.manufacturer,
                model = excluded.model,
                device_type = excluded.device_type,
                firmware_version = excluded.firmware_version,
                online = excluded.online,
                last_contact_at = excluded.last_contact_at,
                connection_request_url = excluded.connection_request_url,
                udp_rendezvous_addr = excluded.udp_rendezvous_addr,
                xmpp_jid = excluded.xmpp_jid,
                stun_enabled = excluded.stun_enabled,
                parent_device_id = excluded.parent_device_id,
                attributes = excluded.attributes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&device.id)
        .bind(&device.manufacturer)
        .bind(&device.model)
        .bind(&device.device_type)
        .bind(&device.firmware_version)
        .bind(device.online)
        .bind(device.last_contact_at)
        .bind(&device.reachability.connection_request_url)
        .bind(&device.reachability.udp_rendezvous_addr)
        .bind(&device.reachability.xmpp_jid)
        .bind(device.reachability.stun_enabled)
        .bind(&device.parent_device_id)
        .bind(attributes)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("设备记录已保存: {}", device.id);
        Ok(())
    }

    async fn list_all(&self) -> FleetResult<Vec<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_device).collect()
    }

    #[instrument(skip(self))]
    async fn set_online(
        &self,
        id: &str,
        online: bool,
        last_contact_at: Option<DateTime<Utc>>,
    ) -> FleetResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET online = ?2,
                last_contact_at = COALESCE(?3, last_contact_at),
                updated_at = ?4
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(online)
        .bind(last_contact_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::device_not_found(id));
        }
        debug!("设备 {} 在线状态更新为 {}", id, online);
        Ok(())
    }
}
