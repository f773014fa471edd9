use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 设备唤醒配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 单次唤醒尝试的超时时间
    pub wake_timeout_seconds: u64,
    /// UDP 连接请求报文的发送次数
    pub udp_retransmits: u32,
    pub udp_bind_address: String,
    /// XMPP 网关地址，未配置时禁用 presence 唤醒
    pub xmpp_gateway_url: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wake_timeout_seconds: 10,
            udp_retransmits: 3,
            udp_bind_address: "0.0.0.0:0".to_string(),
            xmpp_gateway_url: None,
        }
    }
}

impl ConfigValidator for ConnectionConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.wake_timeout_seconds,
            "connection.wake_timeout_seconds",
            300,
        )?;
        ValidationUtils::validate_count(
            self.udp_retransmits as u64,
            "connection.udp_retransmits",
            10,
        )?;
        ValidationUtils::validate_socket_addr(
            &self.udp_bind_address,
            "connection.udp_bind_address",
        )?;
        if let Some(url) = &self.xmpp_gateway_url {
            ValidationUtils::validate_http_url(url, "connection.xmpp_gateway_url")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_validation() {
        assert!(ConnectionConfig::default().validate().is_ok());

        let config = ConnectionConfig {
            xmpp_gateway_url: Some("xmpp.example.com".to_string()),
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ConnectionConfig {
            xmpp_gateway_url: Some("http://xmpp-gw:5280/wake".to_string()),
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
