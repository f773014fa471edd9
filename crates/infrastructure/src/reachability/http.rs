use async_trait::async_trait;
use fleet_core::{Device, FleetError, FleetResult, ReachabilityStrategy, WakeStrategyKind};
use tracing::debug;

/// 直接回调：向设备公布的连接请求地址发送 HTTP GET
///
/// 设备收到请求后会主动向服务器发起会话。任何 2xx 响应都视为送达。
pub struct HttpConnectionRequestStrategy {
    http_client: reqwest::Client,
}

impl HttpConnectionRequestStrategy {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl ReachabilityStrategy for HttpConnectionRequestStrategy {
    fn kind(&self) -> WakeStrategyKind {
        WakeStrategyKind::DirectCallback
    }

    async fn wake(&self, device: &Device) -> FleetResult<()> {
        let url = device
            .reachability
            .connection_request_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                FleetError::validation_error(format!("设备 {} 未公布连接请求地址", device.id))
            })?;

        let response = self.http_client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FleetError::Timeout(format!("连接请求超时: {url}"))
            } else {
                FleetError::Network(format!("连接请求发送失败: {url} - {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!("设备 {} 已接受连接请求 (HTTP {})", device.id, status);
            Ok(())
        } else {
            Err(FleetError::Network(format!(
                "设备 {} 拒绝连接请求: HTTP {status}",
                device.id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use fleet_testing_utils::DeviceBuilder;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_successful_connection_request() {
        let base = serve(Router::new().route("/cr", get(|| async { StatusCode::NO_CONTENT }))).await;
        let device = DeviceBuilder::new("CPE-1")
            .with_connection_request_url(&format!("{base}/cr"))
            .build();

        let strategy = HttpConnectionRequestStrategy::new(reqwest::Client::new());
        assert!(strategy.applies_to(&device));
        strategy.wake(&device).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_connection_request_is_network_error() {
        let base =
            serve(Router::new().route("/cr", get(|| async { StatusCode::UNAUTHORIZED }))).await;
        let device = DeviceBuilder::new("CPE-1")
            .with_connection_request_url(&format!("{base}/cr"))
            .build();

        let strategy = HttpConnectionRequestStrategy::new(reqwest::Client::new());
        let err = strategy.wake(&device).await.unwrap_err();
        assert!(matches!(err, FleetError::Network(_)));
    }

    #[tokio::test]
    async fn test_device_without_address_is_rejected() {
        let device = DeviceBuilder::new("CPE-1").build();
        let strategy = HttpConnectionRequestStrategy::new(reqwest::Client::new());
        assert!(!strategy.applies_to(&device));
        assert!(strategy.wake(&device).await.is_err());
    }
}
