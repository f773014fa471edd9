use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{FleetError, FleetResult, Task, TaskRepository, TaskStatus};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "id, device_id, kind, payload, status, resend_count, result, error, \
     initiated_by, workflow_id, execution_id, sent_at, deadline_at, completed_at, created_at, \
     updated_at";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> FleetResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            kind: row.try_get("kind")?,
            payload: MappingHelpers::parse_json(row, "payload")?,
            status: row.try_get("status")?,
            resend_count: row.try_get("resend_count")?,
            result: MappingHelpers::parse_optional_json(row, "result")?,
            error: row.try_get("error")?,
            initiated_by: row.try_get("initiated_by")?,
            workflow_id: row.try_get("workflow_id")?,
            execution_id: row.try_get("execution_id")?,
            sent_at: row.try_get("sent_at")?,
            deadline_at: row.try_get("deadline_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_where(&self, condition: &str, device_id: &str) -> FleetResult<Vec<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE {condition}");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(device_id = %task.device_id, kind = %task.kind))]
    async fn create(&self, task: &Task) -> FleetResult<Task> {
        let payload = MappingHelpers::to_json_text(&task.payload)?;
        let result = MappingHelpers::to_optional_json_text(task.result.as_ref())?;

        let sql = format!(
            r#"
            INSERT INTO tasks (device_id, kind, payload, status, resend_count, result, error,
                initiated_by, workflow_id, execution_id, sent_at, deadline_at, completed_at,
                created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&task.device_id)
            .bind(task.kind)
            .bind(payload)
            .bind(task.status)
            .bind(task.resend_count)
            .bind(result)
            .bind(&task.error)
            .bind(&task.initiated_by)
            .bind(task.workflow_id)
            .bind(task.execution_id)
            .bind(task.sent_at)
            .bind(task.deadline_at)
            .bind(task.completed_at)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_task(&row)?;
        debug!("任务已创建: ID {}, 设备 {}", created.id, created.device_id);
        Ok(created)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get(&self, id: i64) -> FleetResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, next = %task.status))]
    async fn compare_and_set(&self, task: &Task, expected: TaskStatus) -> FleetResult<bool> {
        let payload = MappingHelpers::to_json_text(&task.payload)?;
        let result = MappingHelpers::to_optional_json_text(task.result.as_ref())?;

        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET payload = ?3, status = ?4, resend_count = ?5, result = ?6, error = ?7,
                sent_at = ?8, deadline_at = ?9, completed_at = ?10, updated_at = ?11
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(task.id)
        .bind(expected)
        .bind(payload)
        .bind(task.status)
        .bind(task.resend_count)
        .bind(result)
        .bind(&task.error)
        .bind(task.sent_at)
        .bind(task.deadline_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM tasks WHERE id = ?1")
            .bind(task.id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => {
                debug!("任务 {} 状态已被修改，条件更新未生效", task.id);
                Ok(false)
            }
            None => Err(FleetError::TaskNotFound { id: task.id }),
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, device_id = %task.device_id))]
    async fn claim_for_delivery(&self, task: &Task) -> FleetResult<bool> {
        let conflicting = task.kind.conflicting_kinds();
        let mut sql = String::from(
            "UPDATE tasks SET status = 'SENT', sent_at = ?2, deadline_at = ?3, updated_at = ?4 \
             WHERE id = ?1 AND status = 'PENDING'",
        );
        if !conflicting.is_empty() {
            let placeholders = (0..conflicting.len())
                .map(|i| format!("?{}", i + 6))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(
                " AND NOT EXISTS (SELECT 1 FROM tasks other WHERE other.device_id = ?5 \
                 AND other.status = 'SENT' AND other.kind IN ({placeholders}))"
            ));
        }

        let mut query = sqlx::query(&sql)
            .bind(task.id)
            .bind(task.sent_at)
            .bind(task.deadline_at)
            .bind(task.updated_at);
        if !conflicting.is_empty() {
            query = query.bind(&task.device_id);
            for kind in conflicting {
                query = query.bind(kind);
            }
        }

        let outcome = query.execute(&self.pool).await?;
        if outcome.rows_affected() == 0 {
            debug!("任务 {} 未能认领下发", task.id);
        }
        Ok(outcome.rows_affected() == 1)
    }

    async fn pending_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        self.fetch_where("device_id = ?1 AND status = 'PENDING' ORDER BY id", device_id)
            .await
    }

    async fn sent_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        self.fetch_where("device_id = ?1 AND status = 'SENT' ORDER BY id", device_id)
            .await
    }

    async fn expired_sent(&self, now: DateTime<Utc>) -> FleetResult<Vec<Task>> {
        // 时间以文本存储，截止时间在内存中比较
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'SENT' ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        let mut expired = Vec::new();
        for row in &rows {
            let task = Self::row_to_task(row)?;
            if task.is_expired(now) {
                expired.push(task);
            }
        }
        Ok(expired)
    }

    async fn count_created_for_workflow_since(
        &self,
        workflow_id: i64,
        since: DateTime<Utc>,
    ) -> FleetResult<u64> {
        let created: Vec<DateTime<Utc>> =
            sqlx::query_scalar("SELECT created_at FROM tasks WHERE workflow_id = ?1")
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(created.into_iter().filter(|at| *at >= since).count() as u64)
    }

    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Task>> {
        self.fetch_where("device_id = ?1 ORDER BY id DESC", device_id)
            .await
    }
}
