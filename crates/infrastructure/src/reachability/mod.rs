//! 设备唤醒策略
//!
//! - `HttpConnectionRequestStrategy`：向设备公布的连接请求地址发送 HTTP 请求
//! - `UdpRendezvousStrategy`：向 NAT 后设备注册的 UDP 汇合地址发送连接请求报文
//! - `XmppPresenceStrategy`：通过 XMPP 网关向设备的持久会话发送唤醒通知

mod http;
mod udp;
mod xmpp;

use std::sync::Arc;
use std::time::Duration;

use fleet_config::ConnectionConfig;
use fleet_core::{FleetError, FleetResult, ReachabilityStrategy};
use tracing::info;

pub use http::HttpConnectionRequestStrategy;
pub use udp::UdpRendezvousStrategy;
pub use xmpp::XmppPresenceStrategy;

fn http_client(timeout: Duration) -> FleetResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FleetError::Configuration(format!("创建 HTTP 客户端失败: {e}")))
}

/// 根据连接配置构建全部可用的唤醒策略
///
/// 未配置 XMPP 网关时不启用 presence 唤醒。
pub fn build_strategies(config: &ConnectionConfig) -> FleetResult<Vec<Arc<dyn ReachabilityStrategy>>> {
    let timeout = Duration::from_secs(config.wake_timeout_seconds);
    let mut strategies: Vec<Arc<dyn ReachabilityStrategy>> = vec![
        Arc::new(HttpConnectionRequestStrategy::new(http_client(timeout)?)),
        Arc::new(UdpRendezvousStrategy::new(
            config.udp_bind_address.clone(),
            config.udp_retransmits,
        )),
    ];

    if let Some(gateway_url) = &config.xmpp_gateway_url {
        strategies.push(Arc::new(XmppPresenceStrategy::new(
            gateway_url.clone(),
            http_client(timeout)?,
        )));
    }

    let kinds: Vec<String> = strategies.iter().map(|s| s.kind().to_string()).collect();
    info!("已启用唤醒策略: {}", kinds.join(", "));
    Ok(strategies)
}
