//! # 数据模型
//!
//! 定义设备编排引擎的核心数据结构：设备、任务、设备分组与规则、工作流、执行记录和固件镜像。
//!
//! ## 设计原则
//!
//! - 所有时间字段使用 `DateTime<Utc>`
//! - 状态字段使用封闭的枚举类型，数据库中以大写文本存储
//! - 统计信息（进度、失败率）都是对任务表和执行记录表的派生投影，不保存可漂移的计数器

/// 为文本枚举实现 `as_str`、`Display`、`FromStr` 以及 SQLite 的编解码
macro_rules! text_enum {
    ($name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::FleetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::FleetError::Serialization(format!(
                        "无效的{}: {other}",
                        $label
                    ))),
                }
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <str as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                s.parse::<$name>().map_err(|e| e.to_string().into())
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
            }
        }
    };
}

pub mod device;
pub mod execution;
pub mod firmware;
pub mod group;
pub mod task;
pub mod workflow;

pub use device::{Device, DeviceSnapshot, ReachabilityHints, WakeStrategyKind};
pub use execution::{Execution, ExecutionStats, ExecutionStatus};
pub use firmware::{FirmwareImage, UpgradeEdge};
pub use group::{DeviceGroup, MatchType, Rule, RuleOperator};
pub use task::{Task, TaskEvent, TaskKind, TaskStatus};
pub use workflow::{ScheduleMode, Workflow, WorkflowProgress, WorkflowStatus};
