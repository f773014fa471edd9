use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult, Workflow, WorkflowRepository, WorkflowStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const WORKFLOW_COLUMNS: &str = "id, name, group_id, task_kind, parameters, schedule_mode, \
     scheduled_at, cron_expression, rate_limit, max_concurrent, retry_count, \
     retry_delay_minutes, stop_on_failure_percent, depends_on_workflow_id, run_once_per_device, \
     status, activated_at, last_fired_at, created_at, updated_at";

pub struct SqliteWorkflowRepository {
    pool: SqlitePool,
}

impl SqliteWorkflowRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_workflow(row: &SqliteRow) -> FleetResult<Workflow> {
        Ok(Workflow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            group_id: row.try_get("group_id")?,
            task_kind: row.try_get("task_kind")?,
            parameters: MappingHelpers::parse_json(row, "parameters")?,
            schedule_mode: row.try_get("schedule_mode")?,
            scheduled_at: row.try_get("scheduled_at")?,
            cron_expression: row.try_get("cron_expression")?,
            rate_limit: MappingHelpers::get_u32(row, "rate_limit")?,
            max_concurrent: MappingHelpers::get_u32(row, "max_concurrent")?,
            retry_count: MappingHelpers::get_u32(row, "retry_count")?,
            retry_delay_minutes: MappingHelpers::get_u32(row, "retry_delay_minutes")?,
            stop_on_failure_percent: MappingHelpers::get_u32(row, "stop_on_failure_percent")?,
            depends_on_workflow_id: row.try_get("depends_on_workflow_id")?,
            run_once_per_device: row.try_get("run_once_per_device")?,
            status: row.try_get("status")?,
            activated_at: row.try_get("activated_at")?,
            last_fired_at: row.try_get("last_fired_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn exists(&self, id: i64) -> FleetResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM workflows WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl WorkflowRepository for SqliteWorkflowRepository {
    #[instrument(skip(self, workflow), fields(workflow_name = %workflow.name))]
    async fn create(&self, workflow: &Workflow) -> FleetResult<Workflow> {
        let parameters = MappingHelpers::to_json_text(&workflow.parameters)?;

        let sql = format!(
            r#"
            INSERT INTO workflows (name, group_id, task_kind, parameters, schedule_mode,
                scheduled_at, cron_expression, rate_limit, max_concurrent, retry_count,
                retry_delay_minutes, stop_on_failure_percent, depends_on_workflow_id,
                run_once_per_device, status, activated_at, last_fired_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                ?18, ?19)
            RETURNING {WORKFLOW_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&workflow.name)
            .bind(workflow.group_id)
            .bind(workflow.task_kind)
            .bind(parameters)
            .bind(workflow.schedule_mode)
            .bind(workflow.scheduled_at)
            .bind(&workflow.cron_expression)
            .bind(i64::from(workflow.rate_limit))
            .bind(i64::from(workflow.max_concurrent))
            .bind(i64::from(workflow.retry_count))
            .bind(i64::from(workflow.retry_delay_minutes))
            .bind(i64::from(workflow.stop_on_failure_percent))
            .bind(workflow.depends_on_workflow_id)
            .bind(workflow.run_once_per_device)
            .bind(workflow.status)
            .bind(workflow.activated_at)
            .bind(workflow.last_fired_at)
            .bind(workflow.created_at)
            .bind(workflow.updated_at)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_workflow(&row)?;
        debug!("工作流已创建: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Workflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_workflow).transpose()
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn update(&self, workflow: &Workflow) -> FleetResult<()> {
        let parameters = MappingHelpers::to_json_text(&workflow.parameters)?;

        // 状态只能通过 transition_status 修改
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = ?2, group_id = ?3, task_kind = ?4, parameters = ?5, schedule_mode = ?6,
                scheduled_at = ?7, cron_expression = ?8, rate_limit = ?9, max_concurrent = ?10,
                retry_count = ?11, retry_delay_minutes = ?12, stop_on_failure_percent = ?13,
                depends_on_workflow_id = ?14, run_once_per_device = ?15, last_fired_at = ?16,
                updated_at = ?17
            WHERE id = ?1
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.group_id)
        .bind(workflow.task_kind)
        .bind(parameters)
        .bind(workflow.schedule_mode)
        .bind(workflow.scheduled_at)
        .bind(&workflow.cron_expression)
        .bind(i64::from(workflow.rate_limit))
        .bind(i64::from(workflow.max_concurrent))
        .bind(i64::from(workflow.retry_count))
        .bind(i64::from(workflow.retry_delay_minutes))
        .bind(i64::from(workflow.stop_on_failure_percent))
        .bind(workflow.depends_on_workflow_id)
        .bind(workflow.run_once_per_device)
        .bind(workflow.last_fired_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(FleetError::WorkflowNotFound { id: workflow.id });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn transition_status(
        &self,
        id: i64,
        expected: WorkflowStatus,
        next: WorkflowStatus,
        at: DateTime<Utc>,
    ) -> FleetResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET status = ?3,
                updated_at = ?4,
                activated_at = CASE
                    WHEN ?3 = 'ACTIVE' AND activated_at IS NULL THEN ?4
                    ELSE activated_at
                END
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("工作流 {} 状态: {} -> {}", id, expected, next);
            return Ok(true);
        }
        if !self.exists(id).await? {
            return Err(FleetError::WorkflowNotFound { id });
        }
        Ok(false)
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> FleetResult<Vec<Workflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE status = ?1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_workflow).collect()
    }

    async fn list_all(&self) -> FleetResult<Vec<Workflow>> {
        let sql = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_workflow).collect()
    }
}
