use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use fleet_core::{Execution, Workflow};

/// 执行失败后的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// 退回待执行，在 `next_retry_at` 之后重新准入
    Retry { next_retry_at: DateTime<Utc> },
    /// 永久失败
    GiveUp,
}

/// 执行记录的重试策略
///
/// `attempts` 在准入时递增，因此第 n 次尝试失败时 `attempts == n`。
/// `retry_count` 是总尝试次数上限，`attempts < retry_count` 时才重试。
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn decide(workflow: &Workflow, execution: &Execution, now: DateTime<Utc>) -> RetryDecision {
        if execution.attempts >= workflow.retry_count {
            debug!(
                "执行记录 {} 已尝试 {} 次，达到重试上限 {}",
                execution.id, execution.attempts, workflow.retry_count
            );
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            next_retry_at: Self::calculate_next_retry_time(workflow, now),
        }
    }

    pub fn calculate_next_retry_time(workflow: &Workflow, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::minutes(i64::from(workflow.retry_delay_minutes))
    }
}
