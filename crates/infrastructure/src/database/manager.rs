use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use fleet_config::DatabaseConfig;
use fleet_core::{
    DeviceRepository, ExecutionRepository, FleetResult, GroupRepository, TaskRepository,
    WorkflowRepository,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::migrations::run_migrations;
use super::sqlite::{
    SqliteDeviceRepository, SqliteExecutionRepository, SqliteFirmwareRepository,
    SqliteGroupRepository, SqliteTaskRepository, SqliteWorkflowRepository,
};

/// 数据库管理器
///
/// 持有 SQLite 连接池，启动时执行表结构迁移，并为各仓储提供共享连接池。
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 根据配置创建连接池并执行迁移
    pub async fn new(config: &DatabaseConfig) -> FleetResult<Self> {
        let in_memory = config.url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存数据库每个连接都是独立的库，只能使用单连接
        let max_connections = if in_memory { 1 } else { config.max_connections };
        let min_connections = config.min_connections.min(max_connections);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(connect_options).await?;
        run_migrations(&pool).await?;

        info!(
            "数据库连接池已创建: {} (最大连接数: {})",
            config.url, max_connections
        );
        Ok(Self { pool })
    }

    /// 内存数据库，用于测试和临时运行
    pub async fn in_memory() -> FleetResult<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> FleetResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!("数据库健康检查通过");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }

    pub fn device_repository(&self) -> Arc<dyn DeviceRepository> {
        Arc::new(SqliteDeviceRepository::new(self.pool.clone()))
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn group_repository(&self) -> Arc<dyn GroupRepository> {
        Arc::new(SqliteGroupRepository::new(self.pool.clone()))
    }

    pub fn workflow_repository(&self) -> Arc<dyn WorkflowRepository> {
        Arc::new(SqliteWorkflowRepository::new(self.pool.clone()))
    }

    pub fn execution_repository(&self) -> Arc<dyn ExecutionRepository> {
        Arc::new(SqliteExecutionRepository::new(self.pool.clone()))
    }

    /// 固件仓储同时提供导入接口，因此返回具体类型
    pub fn firmware_repository(&self) -> Arc<SqliteFirmwareRepository> {
        Arc::new(SqliteFirmwareRepository::new(self.pool.clone()))
    }
}
