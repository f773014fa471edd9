use async_trait::async_trait;
use fleet_core::{Device, FleetError, FleetResult, ReachabilityStrategy, WakeStrategyKind};
use serde_json::json;
use tracing::debug;

/// presence 唤醒：通过 XMPP 网关向设备的持久会话发送连接请求
///
/// 网关接收 `{"jid": ..., "device_id": ...}`，负责在 XMPP 会话上投递消息。
pub struct XmppPresenceStrategy {
    gateway_url: String,
    http_client: reqwest::Client,
}

impl XmppPresenceStrategy {
    pub fn new(gateway_url: String, http_client: reqwest::Client) -> Self {
        Self {
            gateway_url,
            http_client,
        }
    }
}

#[async_trait]
impl ReachabilityStrategy for XmppPresenceStrategy {
    fn kind(&self) -> WakeStrategyKind {
        WakeStrategyKind::PresenceWake
    }

    async fn wake(&self, device: &Device) -> FleetResult<()> {
        let jid = device
            .reachability
            .xmpp_jid
            .as_deref()
            .filter(|jid| !jid.is_empty())
            .ok_or_else(|| {
                FleetError::validation_error(format!("设备 {} 没有 XMPP 会话", device.id))
            })?;

        let body = json!({
            "jid": jid,
            "device_id": device.id,
        });
        let response = self
            .http_client
            .post(&self.gateway_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FleetError::Timeout(format!("XMPP 网关请求超时: {}", self.gateway_url))
                } else {
                    FleetError::Network(format!("XMPP 网关连接失败: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(FleetError::Network(format!(
                "XMPP 网关拒绝唤醒请求: HTTP {status} - {text}"
            )));
        }

        debug!("已通过 XMPP 网关唤醒设备 {} ({})", device.id, jid);
        Ok(())
    }
}
