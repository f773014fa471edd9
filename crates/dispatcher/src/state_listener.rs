use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info};

use fleet_core::TaskEvent;

use crate::scheduler::WorkflowScheduler;

/// 任务事件监听器
///
/// 消费任务状态机发布的事件并交给调度器推进执行记录。
pub struct StateListener {
    scheduler: Arc<WorkflowScheduler>,
    events: mpsc::UnboundedReceiver<TaskEvent>,
}

impl StateListener {
    pub fn new(scheduler: Arc<WorkflowScheduler>, events: mpsc::UnboundedReceiver<TaskEvent>) -> Self {
        Self { scheduler, events }
    }

    /// 持续处理事件，直到事件通道关闭或收到关闭信号
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("任务事件监听器已启动");
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.process_event(event).await,
                        None => {
                            info!("任务事件通道已关闭，退出监听循环");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let drained = self.drain().await;
                    info!("收到关闭信号，处理完剩余 {} 个事件后退出监听循环", drained);
                    break;
                }
            }
        }
    }

    /// 处理通道中已有的全部事件，返回处理数量
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.events.try_recv() {
            self.process_event(event).await;
            processed += 1;
        }
        processed
    }

    async fn process_event(&self, event: TaskEvent) {
        let task = event.task();
        debug!(
            "处理任务 {} 的事件，当前状态 {}",
            task.id, task.status
        );
        let task_id = task.id;

        if let Err(e) = self.scheduler.on_task_event(event).await {
            error!("处理任务 {} 的事件时出错: {}", task_id, e);
        }
    }
}
