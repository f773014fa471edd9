use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use fleet_core::{
    traits::ReachabilityStrategy, Device, FleetError, StructuredLogger, WakeStrategyKind,
};

/// 单次唤醒尝试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeAttempt {
    pub strategy: WakeStrategyKind,
    pub success: bool,
    pub error: Option<String>,
}

/// 一次唤醒分发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub device_id: String,
    pub attempts: Vec<WakeAttempt>,
    /// 成功送达唤醒请求的策略
    pub succeeded: Option<WakeStrategyKind>,
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        self.succeeded.is_some()
    }

    pub fn attempted(&self) -> Vec<WakeStrategyKind> {
        self.attempts.iter().map(|attempt| attempt.strategy).collect()
    }
}

/// 设备唤醒分发器
///
/// 按偏好顺序尝试适用的策略，失败则尝试下一种，同一策略不重试。
/// 所有策略都失败不是错误，设备会在下次定期连接时取走任务。
pub struct ConnectionDispatcher {
    strategies: Vec<Arc<dyn ReachabilityStrategy>>,
    wake_timeout: Duration,
}

impl ConnectionDispatcher {
    pub fn new(mut strategies: Vec<Arc<dyn ReachabilityStrategy>>, wake_timeout: Duration) -> Self {
        strategies.sort_by_key(|strategy| strategy.kind().preference());
        Self {
            strategies,
            wake_timeout,
        }
    }

    pub fn strategy_kinds(&self) -> Vec<WakeStrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// 依次尝试唤醒设备，返回第一次成功或全部失败后的结果
    pub async fn dispatch(&self, device: &Device) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            device_id: device.id.clone(),
            attempts: Vec::new(),
            succeeded: None,
        };

        for strategy in self.strategies.iter().filter(|s| s.applies_to(device)) {
            let kind = strategy.kind();
            let result = match tokio::time::timeout(self.wake_timeout, strategy.wake(device)).await
            {
                Ok(result) => result,
                Err(_) => Err(FleetError::Timeout(format!(
                    "{} 唤醒超过 {:?}",
                    kind, self.wake_timeout
                ))),
            };

            match result {
                Ok(()) => {
                    StructuredLogger::log_wake_attempt(&device.id, kind, true, None);
                    outcome.attempts.push(WakeAttempt {
                        strategy: kind,
                        success: true,
                        error: None,
                    });
                    outcome.succeeded = Some(kind);
                    return outcome;
                }
                Err(e) => {
                    let message = e.to_string();
                    StructuredLogger::log_wake_attempt(&device.id, kind, false, Some(&message));
                    outcome.attempts.push(WakeAttempt {
                        strategy: kind,
                        success: false,
                        error: Some(message),
                    });
                }
            }
        }

        if outcome.attempts.is_empty() {
            debug!("设备 {} 没有适用的唤醒策略，等待其定期连接", device.id);
        } else {
            info!(
                "设备 {} 的所有唤醒策略均失败，等待其定期连接",
                device.id
            );
        }
        outcome
    }

    /// 在后台执行唤醒，调用方不等待结果
    pub fn dispatch_detached(self: &Arc<Self>, device: Device) -> JoinHandle<DispatchOutcome> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move { dispatcher.dispatch(&device).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::FleetResult;
    use fleet_testing_utils::DeviceBuilder;
    use mockall::mock;

    mock! {
        pub Strategy {}

        #[async_trait]
        impl ReachabilityStrategy for Strategy {
            fn kind(&self) -> WakeStrategyKind;
            async fn wake(&self, device: &Device) -> FleetResult<()>;
        }
    }

    fn strategy(kind: WakeStrategyKind, succeed: bool, calls: usize) -> Arc<dyn ReachabilityStrategy> {
        let mut mock = MockStrategy::new();
        mock.expect_kind().return_const(kind);
        mock.expect_wake().times(calls).returning(move |_| {
            if succeed {
                Ok(())
            } else {
                Err(FleetError::Network("connection refused".to_string()))
            }
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_falls_through_to_next_strategy() {
        let device = DeviceBuilder::new("CPE-1")
            .with_connection_request_url("http://10.0.0.1:7547/")
            .with_xmpp_jid("cpe-1@xmpp.example")
            .build();
        let dispatcher = ConnectionDispatcher::new(
            vec![
                strategy(WakeStrategyKind::PresenceWake, true, 1),
                strategy(WakeStrategyKind::UdpRendezvous, true, 0),
                strategy(WakeStrategyKind::DirectCallback, false, 1),
            ],
            Duration::from_secs(1),
        );
        assert_eq!(
            dispatcher.strategy_kinds(),
            vec![
                WakeStrategyKind::DirectCallback,
                WakeStrategyKind::UdpRendezvous,
                WakeStrategyKind::PresenceWake
            ]
        );

        let outcome = dispatcher.dispatch(&device).await;
        assert_eq!(
            outcome.attempted(),
            vec![WakeStrategyKind::DirectCallback, WakeStrategyKind::PresenceWake]
        );
        assert_eq!(outcome.succeeded, Some(WakeStrategyKind::PresenceWake));
    }

    #[tokio::test]
    async fn test_wake_only_device_failure_is_not_an_error() {
        let device = DeviceBuilder::new("CPE-2")
            .with_xmpp_jid("cpe-2@xmpp.example")
            .build();
        let dispatcher = ConnectionDispatcher::new(
            vec![
                strategy(WakeStrategyKind::DirectCallback, true, 0),
                strategy(WakeStrategyKind::UdpRendezvous, true, 0),
                strategy(WakeStrategyKind::PresenceWake, false, 1),
            ],
            Duration::from_secs(1),
        );

        let outcome = dispatcher.dispatch(&device).await;
        assert_eq!(outcome.attempted(), vec![WakeStrategyKind::PresenceWake]);
        assert!(!outcome.is_delivered());
    }

    #[tokio::test]
    async fn test_slow_strategy_times_out() {
        struct Hanging;

        #[async_trait]
        impl ReachabilityStrategy for Hanging {
            fn kind(&self) -> WakeStrategyKind {
                WakeStrategyKind::DirectCallback
            }

            async fn wake(&self, _device: &Device) -> FleetResult<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let device = DeviceBuilder::new("CPE-3")
            .with_connection_request_url("http://10.0.0.3:7547/")
            .build();
        let dispatcher = Arc::new(ConnectionDispatcher::new(
            vec![Arc::new(Hanging)],
            Duration::from_millis(20),
        ));

        let outcome = dispatcher.dispatch_detached(device).await.unwrap();
        assert!(!outcome.is_delivered());
        assert!(outcome.attempts[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("操作超时")));
    }
}
