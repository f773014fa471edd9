use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_seconds: u64,
    /// 单个执行记录允许的最大固件升级跳数
    pub max_firmware_hops: u32,
    /// 熔断判定前至少需要的终态结果数
    pub breaker_min_samples: u32,
    /// 任务入队后立即尝试唤醒设备
    pub wake_on_queue: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_seconds: 10,
            max_firmware_hops: 5,
            breaker_min_samples: 1,
            wake_on_queue: true,
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.tick_interval_seconds,
            "scheduler.tick_interval_seconds",
            3600,
        )?;
        ValidationUtils::validate_count(
            self.max_firmware_hops as u64,
            "scheduler.max_firmware_hops",
            64,
        )?;
        ValidationUtils::validate_count(
            self.breaker_min_samples as u64,
            "scheduler.breaker_min_samples",
            100_000,
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub refresh_interval_seconds: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: 300,
        }
    }
}

impl ConfigValidator for MembershipConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_seconds(
            self.refresh_interval_seconds,
            "membership.refresh_interval_seconds",
            86_400,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_validation() {
        assert!(SchedulerConfig::default().validate().is_ok());

        let config = SchedulerConfig {
            max_firmware_hops: 0,
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_membership_refresh_interval_must_be_positive() {
        let config = MembershipConfig {
            refresh_interval_seconds: 0,
        };
        assert!(config.validate().is_err());
    }
}
