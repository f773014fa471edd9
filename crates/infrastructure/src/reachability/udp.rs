use async_trait::async_trait;
use chrono::Utc;
use fleet_core::{Device, FleetError, FleetResult, ReachabilityStrategy, WakeStrategyKind};
use tokio::net::UdpSocket;
use tracing::debug;

/// UDP 汇合：向 NAT 后设备通过 STUN 注册的地址发送连接请求报文
///
/// UDP 没有送达确认，报文按配置次数重复发送，只要本地发送成功即视为送达。
pub struct UdpRendezvousStrategy {
    bind_address: String,
    retransmits: u32,
}

impl UdpRendezvousStrategy {
    pub fn new(bind_address: String, retransmits: u32) -> Self {
        Self {
            bind_address,
            retransmits: retransmits.max(1),
        }
    }

    /// 连接请求报文，格式为不带正文的 HTTP 请求行
    fn message(device: &Device, target: &str) -> String {
        format!(
            "GET http://{target}?ts={}&id={} HTTP/1.1\r\nHost: {target}\r\n\r\n",
            Utc::now().timestamp(),
            device.id
        )
    }
}

#[async_trait]
impl ReachabilityStrategy for UdpRendezvousStrategy {
    fn kind(&self) -> WakeStrategyKind {
        WakeStrategyKind::UdpRendezvous
    }

    async fn wake(&self, device: &Device) -> FleetResult<()> {
        let target = device
            .reachability
            .udp_rendezvous_addr
            .as_deref()
            .filter(|addr| !addr.is_empty())
            .ok_or_else(|| {
                FleetError::validation_error(format!("设备 {} 未注册 UDP 汇合地址", device.id))
            })?;

        let socket = UdpSocket::bind(&self.bind_address)
            .await
            .map_err(|e| FleetError::Network(format!("绑定 UDP 地址失败: {} - {e}", self.bind_address)))?;

        let message = Self::message(device, target);
        for _ in 0..self.retransmits {
            socket
                .send_to(message.as_bytes(), target)
                .await
                .map_err(|e| FleetError::Network(format!("UDP 连接请求发送失败: {target} - {e}")))?;
        }

        debug!(
            "已向设备 {} 发送 {} 次 UDP 连接请求: {}",
            device.id, self.retransmits, target
        );
        Ok(())
    }
}
