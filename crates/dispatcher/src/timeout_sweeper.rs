use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use fleet_core::FleetResult;

use crate::task_state_machine::{SweepReport, TaskStateMachine};

/// 任务超时扫描器
///
/// 独立于设备连接事件运行，保证从不再连接的设备上的任务也会超时。
pub struct TimeoutSweeper {
    state_machine: Arc<TaskStateMachine>,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(state_machine: Arc<TaskStateMachine>, interval: Duration) -> Self {
        Self {
            state_machine,
            interval,
        }
    }

    /// 执行一次扫描
    pub async fn sweep_once(&self) -> FleetResult<SweepReport> {
        self.state_machine.sweep_timeouts(Utc::now()).await
    }

    /// 按固定间隔扫描，直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("启动任务超时扫描，间隔 {:?}", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report.resent + report.failed > 0 => debug!(
                            "超时扫描: 重新排队 {} 个, 失败 {} 个",
                            report.resent, report.failed
                        ),
                        Ok(_) => {}
                        Err(e) => error!("任务超时扫描时出错: {}", e),
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到关闭信号，退出任务超时扫描循环");
                    break;
                }
            }
        }
    }
}
