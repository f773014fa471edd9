use async_trait::async_trait;
use fleet_core::{
    Execution, ExecutionRepository, ExecutionStats, ExecutionStatus, FleetError, FleetResult,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const EXECUTION_COLUMNS: &str = "id, workflow_id, device_id, status, task_id, attempts, \
     next_retry_at, result, scheduled_at, started_at, completed_at, updated_at";

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &SqliteRow) -> FleetResult<Execution> {
        Ok(Execution {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            device_id: row.try_get("device_id")?,
            status: row.try_get("status")?,
            task_id: row.try_get("task_id")?,
            attempts: MappingHelpers::get_u32(row, "attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            result: MappingHelpers::parse_optional_json(row, "result")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn fetch_by_workflow(
        &self,
        workflow_id: i64,
        status: Option<ExecutionStatus>,
    ) -> FleetResult<Vec<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE workflow_id = ?1 AND (?2 IS NULL OR status = ?2) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, execution), fields(
        workflow_id = %execution.workflow_id,
        device_id = %execution.device_id,
    ))]
    async fn get_or_create(&self, execution: &Execution) -> FleetResult<(Execution, bool)> {
        let result = MappingHelpers::to_optional_json_text(execution.result.as_ref())?;

        // 唯一约束冲突时不插入，保证每个 (workflow_id, device_id) 至多一条记录
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (workflow_id, device_id, status, task_id, attempts,
                next_retry_at, result, scheduled_at, started_at, completed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(workflow_id, device_id) DO NOTHING
            "#,
        )
        .bind(execution.workflow_id)
        .bind(&execution.device_id)
        .bind(execution.status)
        .bind(execution.task_id)
        .bind(i64::from(execution.attempts))
        .bind(execution.next_retry_at)
        .bind(result)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let stored = self
            .find(execution.workflow_id, &execution.device_id)
            .await?
            .ok_or_else(|| {
                FleetError::database_error(format!(
                    "执行记录读取失败: 工作流 {} 设备 {}",
                    execution.workflow_id, execution.device_id
                ))
            })?;

        if inserted {
            debug!("执行记录已创建: ID {}", stored.id);
        }
        Ok((stored, inserted))
    }

    async fn get(&self, id: i64) -> FleetResult<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn find(&self, workflow_id: i64, device_id: &str) -> FleetResult<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE workflow_id = ?1 AND device_id = ?2"
        );
        let row = sqlx::query(&sql)
            .bind(workflow_id)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_execution).transpose()
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, next = %execution.status))]
    async fn compare_and_set(
        &self,
        execution: &Execution,
        expected: ExecutionStatus,
    ) -> FleetResult<bool> {
        let result = MappingHelpers::to_optional_json_text(execution.result.as_ref())?;

        let outcome = sqlx::query(
            r#"
            UPDATE executions
            SET status = ?3, task_id = ?4, attempts = ?5, next_retry_at = ?6, result = ?7,
                scheduled_at = ?8, started_at = ?9, completed_at = ?10, updated_at = ?11
            WHERE id = ?1 AND status = ?2
            "#,
        )
        .bind(execution.id)
        .bind(expected)
        .bind(execution.status)
        .bind(execution.task_id)
        .bind(i64::from(execution.attempts))
        .bind(execution.next_retry_at)
        .bind(result)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(execution.id).await? {
            Some(current) => {
                debug!(
                    "执行记录 {} 当前状态为 {}，期望 {}，条件更新未生效",
                    execution.id, current.status, expected
                );
                Ok(false)
            }
            None => Err(FleetError::ExecutionNotFound { id: execution.id }),
        }
    }

    async fn list_for_workflow(&self, workflow_id: i64) -> FleetResult<Vec<Execution>> {
        self.fetch_by_workflow(workflow_id, None).await
    }

    async fn list_by_status(
        &self,
        workflow_id: i64,
        status: ExecutionStatus,
    ) -> FleetResult<Vec<Execution>> {
        self.fetch_by_workflow(workflow_id, Some(status)).await
    }

    async fn list_for_device(&self, device_id: &str) -> FleetResult<Vec<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE device_id = ?1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn stats(&self, workflow_id: i64) -> FleetResult<ExecutionStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM executions WHERE workflow_id = ?1 GROUP BY status",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = ExecutionStats::default();
        for row in &rows {
            let status: ExecutionStatus = row.try_get("status")?;
            stats.add(status, MappingHelpers::get_u64(row, "total")?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::sqlite::test_pool::memory_pool;
    use crate::database::sqlite::{SqliteGroupRepository, SqliteWorkflowRepository};
    use fleet_core::{GroupRepository, WorkflowRepository};
    use fleet_testing_utils::{GroupBuilder, WorkflowBuilder};
    use serde_json::json;

    async fn setup() -> (SqliteExecutionRepository, i64) {
        let pool = memory_pool().await;
        let group = SqliteGroupRepository::new(pool.clone())
            .create(&GroupBuilder::new("all").build())
            .await
            .unwrap();
        let workflow = SqliteWorkflowRepository::new(pool.clone())
            .create(&WorkflowBuilder::new("reboot", group.id).build())
            .await
            .unwrap();
        (SqliteExecutionRepository::new(pool), workflow.id)
    }

    #[tokio::test]
    async fn test_get_or_create_is_unique_per_device() {
        let (repo, workflow_id) = setup().await;

        let (first, created) = repo
            .get_or_create(&Execution::new(workflow_id, "CPE-1", ExecutionStatus::Pending))
            .await
            .unwrap();
        assert!(created);

        let (again, created) = repo
            .get_or_create(&Execution::new(workflow_id, "CPE-1", ExecutionStatus::Queued))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, ExecutionStatus::Pending);
        assert_eq!(repo.list_for_workflow(workflow_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_and_stats() {
        let (repo, workflow_id) = setup().await;
        for device in ["CPE-1", "CPE-2", "CPE-3"] {
            repo.get_or_create(&Execution::new(workflow_id, device, ExecutionStatus::Pending))
                .await
                .unwrap();
        }

        let mut failed = repo.find(workflow_id, "CPE-2").await.unwrap().unwrap();
        failed.status = ExecutionStatus::Failed;
        failed.attempts = 1;
        failed.result = Some(json!({"error": "9002 Internal error"}));
        assert!(repo
            .compare_and_set(&failed, ExecutionStatus::Pending)
            .await
            .unwrap());
        assert!(!repo
            .compare_and_set(&failed, ExecutionStatus::Pending)
            .await
            .unwrap());

        let loaded = repo.get(failed.id).await.unwrap().unwrap();
        assert_eq!(loaded.result, failed.result);
        assert_eq!(loaded.attempts, 1);

        let pending: Vec<String> = repo
            .list_by_status(workflow_id, ExecutionStatus::Pending)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.device_id)
            .collect();
        assert_eq!(pending, vec!["CPE-1", "CPE-3"]);
        assert_eq!(repo.list_for_device("CPE-2").await.unwrap().len(), 1);

        let stats = repo.stats(workflow_id).await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);

        let mut missing = failed.clone();
        missing.id = 999;
        let err = repo
            .compare_and_set(&missing, ExecutionStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ExecutionNotFound { id: 999 }));
    }
}
