use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use fleet_core::{DeviceGroup, MatchType, Rule, RuleOperator};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 分组规则
#[derive(Debug, Clone, Deserialize)]
pub struct RuleRequest {
    pub field: String,
    pub operator: RuleOperator,
    pub value: Option<String>,
}

/// 分组创建/替换请求，规则按列表顺序保存
#[derive(Debug, Deserialize)]
pub struct GroupRequest {
    pub name: String,
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub rules: Vec<RuleRequest>,
}

/// 规则预览请求
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    #[serde(default = "default_match_type")]
    pub match_type: MatchType,
    #[serde(default)]
    pub rules: Vec<RuleRequest>,
}

#[derive(Debug, Serialize)]
pub struct GroupDevicesResponse {
    pub group_id: Option<i64>,
    pub count: usize,
    pub devices: Vec<String>,
}

fn default_match_type() -> MatchType {
    MatchType::All
}

fn default_active() -> bool {
    true
}

fn to_rules(rules: &[RuleRequest]) -> Vec<Rule> {
    rules
        .iter()
        .enumerate()
        .map(|(position, rule)| {
            let mut converted = Rule::new(&rule.field, rule.operator, rule.value.as_deref());
            converted.position = position as i32;
            converted
        })
        .collect()
}

impl GroupRequest {
    fn into_group(self, id: i64) -> DeviceGroup {
        let mut group = DeviceGroup::new(self.name, self.match_type).with_priority(self.priority);
        group.id = id;
        group.active = self.active;
        group.rules = to_rules(&self.rules)
            .into_iter()
            .map(|mut rule| {
                rule.group_id = id;
                rule
            })
            .collect();
        group
    }
}

/// 创建分组
pub async fn create_group(
    State(state): State<AppState>,
    Json(request): Json<GroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state.controller.create_group(request.into_group(0)).await?;
    Ok(created(group))
}

/// 替换分组定义和规则
pub async fn update_group(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
    Json(request): Json<GroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let group = state
        .controller
        .update_group(request.into_group(group_id))
        .await?;
    Ok(success(group))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.get_group(group_id).await?))
}

pub async fn list_groups(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.controller.list_groups().await?))
}

/// 预览规则当前匹配的设备，不保存分组
pub async fn preview_group(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<impl IntoResponse> {
    let devices = state
        .controller
        .preview_group(request.match_type, &to_rules(&request.rules))
        .await?;
    Ok(success(GroupDevicesResponse {
        group_id: None,
        count: devices.len(),
        devices,
    }))
}

/// 分组当前成员
pub async fn group_devices(
    State(state): State<AppState>,
    Path(group_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let devices = state.controller.group_members(group_id).await?;
    Ok(success(GroupDevicesResponse {
        group_id: Some(group_id),
        count: devices.len(),
        devices,
    }))
}
