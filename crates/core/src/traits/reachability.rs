use async_trait::async_trait;

use crate::models::{Device, WakeStrategyKind};
use crate::FleetResult;

/// 设备唤醒策略接口
///
/// 每种策略负责一种让设备主动连回服务器的方式。`wake` 只表示唤醒请求本身是否
/// 成功送达，不代表设备随后一定会连接。
#[async_trait]
pub trait ReachabilityStrategy: Send + Sync {
    fn kind(&self) -> WakeStrategyKind;

    /// 根据设备的可达性提示判断该策略是否适用
    fn applies_to(&self, device: &Device) -> bool {
        self.kind().applies_to(device)
    }

    /// 发送唤醒请求，快速失败（连接被拒绝、地址不可达）时返回错误
    async fn wake(&self, device: &Device) -> FleetResult<()>;
}
