//! 数据库行映射辅助函数
//!
//! SQLite 没有原生 JSON 和无符号整数类型：JSON 字段以文本存储，
//! 计数类字段以 INTEGER 存储并在读取时做范围检查。

use fleet_core::{FleetError, FleetResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_json_text<T: Serialize>(value: &T) -> FleetResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    pub fn to_optional_json_text<T: Serialize>(value: Option<&T>) -> FleetResult<Option<String>> {
        value.map(Self::to_json_text).transpose()
    }

    pub fn parse_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> FleetResult<T> {
        let text: String = row.try_get(field_name)?;
        serde_json::from_str(&text)
            .map_err(|e| FleetError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
    }

    pub fn parse_optional_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> FleetResult<Option<T>> {
        let text: Option<String> = row.try_get(field_name)?;
        text.map(|text| {
            serde_json::from_str(&text)
                .map_err(|e| FleetError::Serialization(format!("解析字段 {field_name} 失败: {e}")))
        })
        .transpose()
    }

    pub fn get_u32(row: &SqliteRow, field_name: &str) -> FleetResult<u32> {
        let value: i64 = row.try_get(field_name)?;
        u32::try_from(value)
            .map_err(|_| FleetError::Serialization(format!("字段 {field_name} 超出范围: {value}")))
    }

    pub fn get_u64(row: &SqliteRow, field_name: &str) -> FleetResult<u64> {
        let value: i64 = row.try_get(field_name)?;
        u64::try_from(value)
            .map_err(|_| FleetError::Serialization(format!("字段 {field_name} 超出范围: {value}")))
    }
}
