use std::time::Duration;

use fleet_core::TaskKind;
use serde::{Deserialize, Serialize};

use crate::validation::{ConfigValidator, ValidationUtils};

/// 任务超时与重发配置
///
/// 每种任务类型有独立的截止时间，固件下载远长于参数读取。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTimeoutConfig {
    pub fetch_parameters_seconds: u64,
    pub set_parameters_seconds: u64,
    pub reboot_seconds: u64,
    pub factory_reset_seconds: u64,
    pub download_firmware_seconds: u64,
    pub upload_diagnostic_seconds: u64,
    /// 超时后最多重新下发的次数
    pub max_resends: u32,
    pub sweep_interval_seconds: u64,
}

impl Default for TaskTimeoutConfig {
    fn default() -> Self {
        Self {
            fetch_parameters_seconds: 120,
            set_parameters_seconds: 300,
            reboot_seconds: 600,
            factory_reset_seconds: 1200,
            download_firmware_seconds: 3600,
            upload_diagnostic_seconds: 1800,
            max_resends: 3,
            sweep_interval_seconds: 30,
        }
    }
}

impl TaskTimeoutConfig {
    pub fn timeout_for(&self, kind: TaskKind) -> Duration {
        let seconds = match kind {
            TaskKind::FetchParameters => self.fetch_parameters_seconds,
            TaskKind::SetParameters => self.set_parameters_seconds,
            TaskKind::Reboot => self.reboot_seconds,
            TaskKind::FactoryReset => self.factory_reset_seconds,
            TaskKind::DownloadFirmware => self.download_firmware_seconds,
            TaskKind::UploadDiagnostic => self.upload_diagnostic_seconds,
        };
        Duration::from_secs(seconds)
    }
}

impl ConfigValidator for TaskTimeoutConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        const DAY: u64 = 86_400;
        for kind in TaskKind::ALL {
            let field = format!("tasks.{}_seconds", kind.as_str().to_lowercase());
            ValidationUtils::validate_seconds(self.timeout_for(kind).as_secs(), &field, DAY)?;
        }
        ValidationUtils::validate_seconds(
            self.sweep_interval_seconds,
            "tasks.sweep_interval_seconds",
            3600,
        )?;
        if self.max_resends > 100 {
            return Err(crate::ConfigError::Validation(
                "tasks.max_resends must be less than or equal to 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_firmware_download_gets_longest_default_timeout() {
        let config = TaskTimeoutConfig::default();
        let firmware = config.timeout_for(TaskKind::DownloadFirmware);
        for kind in TaskKind::ALL {
            assert!(config.timeout_for(kind) <= firmware);
        }
        assert_eq!(
            config.timeout_for(TaskKind::FetchParameters),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let config = TaskTimeoutConfig {
            reboot_seconds: 0,
            ..TaskTimeoutConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tasks.reboot_seconds"));
    }
}
