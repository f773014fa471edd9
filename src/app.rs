use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use fleet_api::create_app;
use fleet_config::AppConfig;
use fleet_dispatcher::{
    ConnectionDispatcher, FirmwarePathResolver, FleetController, MembershipIndex,
    SchedulerRepositories, SchedulerTrigger, StateListener, TaskStateMachine, TimeoutSweeper,
    WorkflowScheduler,
};
use fleet_infrastructure::{build_strategies, DatabaseManager, FirmwareCatalog};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownManager;

/// 主应用程序
///
/// 组装仓储、唤醒策略和调度组件，并运行所有后台循环。
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    controller: Arc<FleetController>,
    scheduler: Arc<WorkflowScheduler>,
    membership: Arc<MembershipIndex>,
    sweeper: Arc<TimeoutSweeper>,
    /// 事件监听器只能运行一次，`run` 时取出
    listener: Mutex<Option<StateListener>>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序，数据库: {}", config.database.url);

        let database = DatabaseManager::new(&config.database)
            .await
            .context("初始化数据库失败")?;

        let devices = database.device_repository();
        let tasks = database.task_repository();
        let groups = database.group_repository();
        let repos = SchedulerRepositories {
            devices: devices.clone(),
            tasks: tasks.clone(),
            workflows: database.workflow_repository(),
            executions: database.execution_repository(),
        };

        let strategies = build_strategies(&config.connection).context("创建设备唤醒策略失败")?;
        let dispatcher = Arc::new(ConnectionDispatcher::new(
            strategies,
            Duration::from_secs(config.connection.wake_timeout_seconds),
        ));
        info!("设备唤醒策略: {:?}", dispatcher.strategy_kinds());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state_machine = Arc::new(
            TaskStateMachine::new(
                tasks,
                devices.clone(),
                repos.workflows.clone(),
                config.tasks.clone(),
            )
            .with_events(events_tx),
        );

        let membership = Arc::new(MembershipIndex::new(devices, groups.clone()));
        membership
            .rebuild()
            .await
            .context("构建分组成员索引失败")?;

        let resolver = Arc::new(FirmwarePathResolver::new(database.firmware_repository()));
        let scheduler = Arc::new(
            WorkflowScheduler::new(
                repos.clone(),
                membership.clone(),
                resolver,
                state_machine.clone(),
                config.scheduler.clone(),
            )
            .with_dispatcher(dispatcher.clone()),
        );

        let controller = Arc::new(
            FleetController::new(
                repos,
                groups,
                state_machine.clone(),
                membership.clone(),
                scheduler.clone(),
            )
            .with_dispatcher(dispatcher),
        );

        let sweeper = Arc::new(TimeoutSweeper::new(
            state_machine,
            Duration::from_secs(config.tasks.sweep_interval_seconds),
        ));
        let listener = StateListener::new(scheduler.clone(), events_rx);

        Ok(Self {
            config,
            database,
            controller,
            scheduler,
            membership,
            sweeper,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn controller(&self) -> Arc<FleetController> {
        Arc::clone(&self.controller)
    }

    pub fn router(&self) -> Router {
        create_app(self.controller(), &self.config.api)
    }

    /// 导入固件目录文件
    pub async fn import_firmware_catalog(&self, path: &Path) -> Result<()> {
        let catalog = FirmwareCatalog::load(path)?;
        catalog
            .apply(&self.database.firmware_repository())
            .await
            .with_context(|| format!("导入固件目录失败: {}", path.display()))?;
        Ok(())
    }

    /// 运行所有后台组件，直到收到关闭信号
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        info!("启动应用程序");
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // 启动任务事件监听器
        match self.listener.lock().await.take() {
            Some(listener) => {
                let shutdown_rx = shutdown.subscribe().await;
                handles.push(tokio::spawn(listener.run(shutdown_rx)));
            }
            None => warn!("任务事件监听器已在运行"),
        }

        if self.config.scheduler.enabled {
            let scheduler = Arc::clone(&self.scheduler);
            let interval = self.config.scheduler.tick_interval_seconds;
            let shutdown_rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                run_scheduler_loop(scheduler, interval, shutdown_rx).await;
            }));
        } else {
            warn!("调度器已禁用，工作流只在设备连接时推进");
        }

        {
            let sweeper = Arc::clone(&self.sweeper);
            let shutdown_rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                sweeper.run(shutdown_rx).await;
            }));
        }

        {
            let membership = Arc::clone(&self.membership);
            let interval = self.config.membership.refresh_interval_seconds;
            let shutdown_rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                run_membership_refresh_loop(membership, interval, shutdown_rx).await;
            }));
        }

        if self.config.api.enabled {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .with_context(|| format!("绑定地址失败: {}", self.config.api.bind_address))?;
            info!("API服务器启动在 http://{}", self.config.api.bind_address);

            let app = self.router();
            let mut shutdown_rx = shutdown.subscribe().await;
            handles.push(tokio::spawn(async move {
                let server = axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.recv().await;
                        info!("API服务器收到关闭信号");
                    });
                if let Err(e) = server.await {
                    error!("API服务器运行失败: {}", e);
                }
            }));
        }

        futures::future::join_all(handles).await;

        self.database.close().await;
        info!("所有组件已停止");
        Ok(())
    }
}

/// 运行调度器循环
async fn run_scheduler_loop(
    scheduler: Arc<WorkflowScheduler>,
    interval_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scheduler.handle(SchedulerTrigger::Tick).await {
                    Ok(admitted) if admitted > 0 => debug!("调度周期准入 {} 个执行", admitted),
                    Ok(_) => {}
                    Err(e) => error!("工作流调度失败: {}", e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("调度器循环收到关闭信号");
                break;
            }
        }
    }
}

/// 定期全量重建分组成员索引，修正增量更新遗漏的变化
async fn run_membership_refresh_loop(
    membership: Arc<MembershipIndex>,
    interval_seconds: u64,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
    // 启动时已经重建过一次
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = membership.rebuild().await {
                    error!("重建分组成员索引失败: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("成员索引刷新循环收到关闭信号");
                break;
            }
        }
    }
}
