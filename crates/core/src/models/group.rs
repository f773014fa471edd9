use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 动态设备分组
///
/// 成员由规则计算得出。`priority` 用于设备同时匹配多个分组时的排序，数值越大越优先。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceGroup {
    pub id: i64,
    pub name: String,
    pub match_type: MatchType,
    pub active: bool,
    pub priority: i32,
    /// 按 `position` 排序的规则列表
    pub rules: Vec<Rule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 规则组合方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    /// 所有规则都满足
    All,
    /// 任意规则满足
    Any,
}

text_enum!(MatchType, "匹配方式" {
    All => "ALL",
    Any => "ANY",
});

/// 分组规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub group_id: i64,
    pub position: i32,
    pub field: String,
    pub operator: RuleOperator,
    /// 比较值；`IN`/`NOT_IN` 时为 JSON 编码的列表，`IS_NULL`/`IS_NOT_NULL` 时被忽略
    pub value: Option<String>,
}

/// 规则运算符
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Regex,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

text_enum!(RuleOperator, "规则运算符" {
    Equals => "EQUALS",
    NotEquals => "NOT_EQUALS",
    Contains => "CONTAINS",
    NotContains => "NOT_CONTAINS",
    StartsWith => "STARTS_WITH",
    EndsWith => "ENDS_WITH",
    GreaterThan => "GREATER_THAN",
    GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
    LessThan => "LESS_THAN",
    LessThanOrEqual => "LESS_THAN_OR_EQUAL",
    Regex => "REGEX",
    In => "IN",
    NotIn => "NOT_IN",
    IsNull => "IS_NULL",
    IsNotNull => "IS_NOT_NULL",
});

impl RuleOperator {
    /// 是否忽略比较值
    pub fn ignores_value(&self) -> bool {
        matches!(self, RuleOperator::IsNull | RuleOperator::IsNotNull)
    }
}

impl Rule {
    pub fn new(field: impl Into<String>, operator: RuleOperator, value: Option<&str>) -> Self {
        Self {
            id: 0,
            group_id: 0,
            position: 0,
            field: field.into(),
            operator,
            value: value.map(str::to_string),
        }
    }
}

impl DeviceGroup {
    /// 创建新分组
    pub fn new(name: impl Into<String>, match_type: MatchType) -> Self {
        let now = Utc::now();
        Self {
            id: 0, // 将由数据库生成
            name: name.into(),
            match_type,
            active: true,
            priority: 0,
            rules: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 追加规则，位置按追加顺序递增
    pub fn with_rule(mut self, mut rule: Rule) -> Self {
        rule.position = self.rules.len() as i32;
        rule.group_id = self.id;
        self.rules.push(rule);
        self
    }

    /// 按声明顺序返回规则
    pub fn ordered_rules(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by_key(|rule| (rule.position, rule.id));
        rules
    }

    /// 规则引用的字段集合
    pub fn referenced_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = self.rules.iter().map(|r| r.field.as_str()).collect();
        fields.sort_unstable();
        fields.dedup();
        fields
    }
}
