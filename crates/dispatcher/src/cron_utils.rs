use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::debug;

use fleet_core::{FleetError, FleetResult};

/// CRON表达式解析和调度工具
///
/// 表达式采用 `cron` crate 的格式（秒 分 时 日 月 周 [年]）。
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> FleetResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| FleetError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 返回 `(since, now]` 区间内最近的一次触发时间
    ///
    /// 调度器停机期间错过的多次触发合并为一次，只处理最近的那次。
    /// 从 `now` 向前查找，耗时与停机时长无关。
    pub fn latest_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let latest = self
            .schedule
            .after(&(now + Duration::seconds(1)))
            .rev()
            .find(|occurrence| *occurrence <= now)
            .filter(|occurrence| *occurrence > since);

        if let Some(occurrence) = latest {
            debug!(
                "CRON触发: 上次={}, 本次={}, 当前时间={}",
                since.format("%Y-%m-%d %H:%M:%S UTC"),
                occurrence.format("%Y-%m-%d %H:%M:%S UTC"),
                now.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        latest
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> FleetResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_invalid_expression() {
        let err = CronScheduler::new("not a cron").err().unwrap();
        assert!(matches!(err, FleetError::InvalidCron { .. }));
        assert!(CronScheduler::validate_cron_expression("0 0 2 * * *").is_ok());
    }

    #[test]
    fn test_latest_due_collapses_missed_occurrences() {
        let cron = CronScheduler::new("0 0 * * * *").unwrap();
        assert_eq!(cron.latest_due(at(1, 30), at(4, 10)), Some(at(4, 0)));
        assert_eq!(cron.latest_due(at(4, 0), at(4, 10)), None);
        assert_eq!(cron.latest_due(at(3, 59), at(4, 0)), Some(at(4, 0)));
        assert_eq!(cron.latest_due(at(4, 0), at(4, 59)), None);
    }

    #[test]
    fn test_latest_due_includes_occurrence_within_current_second() {
        let cron = CronScheduler::new("0 30 2 * * *").unwrap();
        let now = at(2, 30) + Duration::milliseconds(250);
        assert_eq!(cron.latest_due(at(1, 0), now), Some(at(2, 30)));
        assert_eq!(cron.latest_due(at(1, 0), at(2, 29)), None);
    }

    #[test]
    fn test_latest_due_after_long_outage_with_per_second_schedule() {
        let cron = CronScheduler::new("* * * * * *").unwrap();
        let since = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 4, 10, 7).unwrap();
        assert_eq!(cron.latest_due(since, now), Some(now));
    }
}
