use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{DeviceGroup, FleetError, FleetResult, GroupRepository, Rule};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

pub struct SqliteGroupRepository {
    pool: SqlitePool,
}

impl SqliteGroupRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_group(row: &SqliteRow) -> FleetResult<DeviceGroup> {
        Ok(DeviceGroup {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            match_type: row.try_get("match_type")?,
            active: row.try_get("active")?,
            priority: row.try_get("priority")?,
            rules: Vec::new(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_rule(row: &SqliteRow) -> FleetResult<Rule> {
        Ok(Rule {
            id: row.try_get("id")?,
            group_id: row.try_get("group_id")?,
            position: row.try_get("position")?,
            field: row.try_get("field")?,
            operator: row.try_get("operator")?,
            value: row.try_get("value")?,
        })
    }

    /// 按声明顺序写入规则，位置取列表下标
    async fn insert_rules(
        tx: &mut Transaction<'_, Sqlite>,
        group_id: i64,
        rules: &[&Rule],
    ) -> FleetResult<()> {
        for (position, rule) in rules.iter().enumerate() {
            sqlx::query(
                "INSERT INTO group_rules (group_id, position, field, operator, value) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(group_id)
            .bind(position as i32)
            .bind(&rule.field)
            .bind(rule.operator)
            .bind(&rule.value)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn load_rules(&self, group_ids: &[i64]) -> FleetResult<HashMap<i64, Vec<Rule>>> {
        let mut rules: HashMap<i64, Vec<Rule>> = HashMap::new();
        if group_ids.is_empty() {
            return Ok(rules);
        }

        let placeholders: Vec<String> = (1..=group_ids.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT id, group_id, position, field, operator, value FROM group_rules \
             WHERE group_id IN ({}) ORDER BY group_id, position, id",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for id in group_ids {
            query = query.bind(*id);
        }

        for row in query.fetch_all(&self.pool).await? {
            let rule = Self::row_to_rule(&row)?;
            rules.entry(rule.group_id).or_default().push(rule);
        }
        Ok(rules)
    }

    async fn fetch_groups(&self, rows: Vec<SqliteRow>) -> FleetResult<Vec<DeviceGroup>> {
        let mut groups = rows
            .iter()
            .map(Self::row_to_group)
            .collect::<FleetResult<Vec<_>>>()?;
        let ids: Vec<i64> = groups.iter().map(|g| g.id).collect();
        let mut rules = self.load_rules(&ids).await?;
        for group in &mut groups {
            group.rules = rules.remove(&group.id).unwrap_or_default();
        }
        Ok(groups)
    }
}

#[async_trait]
impl GroupRepository for SqliteGroupRepository {
    #[instrument(skip(self, group), fields(group_name = %group.name))]
    async fn create(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup> {
        let mut tx = self.pool.begin().await?;

        let group_id: i64 = sqlx::query_scalar(
            "INSERT INTO device_groups (name, match_type, active, priority, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
        )
        .bind(&group.name)
        .bind(group.match_type)
        .bind(group.active)
        .bind(group.priority)
        .bind(group.created_at)
        .bind(group.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_rules(&mut tx, group_id, &group.ordered_rules()).await?;
        tx.commit().await?;

        debug!("设备分组已创建: {} (ID: {})", group.name, group_id);
        self.get(group_id)
            .await?
            .ok_or_else(|| FleetError::database_error(format!("新建分组 {group_id} 读取失败")))
    }

    #[instrument(skip(self, group), fields(group_id = %group.id))]
    async fn update(&self, group: &DeviceGroup) -> FleetResult<DeviceGroup> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE device_groups SET name = ?2, match_type = ?3, active = ?4, priority = ?5, \
             updated_at = ?6 WHERE id = ?1",
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(group.match_type)
        .bind(group.active)
        .bind(group.priority)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(FleetError::GroupNotFound { id: group.id });
        }

        sqlx::query("DELETE FROM group_rules WHERE group_id = ?1")
            .bind(group.id)
            .execute(&mut *tx)
            .await?;
        Self::insert_rules(&mut tx, group.id, &group.ordered_rules()).await?;
        tx.commit().await?;

        debug!("设备分组已更新: {} (ID: {})", group.name, group.id);
        self.get(group.id)
            .await?
            .ok_or(FleetError::GroupNotFound { id: group.id })
    }

    async fn get(&self, id: i64) -> FleetResult<Option<DeviceGroup>> {
        let row = sqlx::query(
            "SELECT id, name, match_type, active, priority, created_at, updated_at \
             FROM device_groups WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.fetch_groups(vec![row]).await?.into_iter().next()),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> FleetResult<Vec<DeviceGroup>> {
        let rows = sqlx::query(
            "SELECT id, name, match_type, active, priority, created_at, updated_at \
             FROM device_groups ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        self.fetch_groups(rows).await
    }
}
