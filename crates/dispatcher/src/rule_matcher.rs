//! 分组规则匹配
//!
//! 规则在使用前编译为 [`RuleCondition`]：正则表达式只编译一次，`IN`/`NOT_IN` 的
//! JSON 列表只解析一次。每个运算符对应一个求值分支，新增运算符时编译器会检查遗漏。
//!
//! 字段语义：
//! - 未知字段名在编译时报错（`UnknownField`）
//! - 已知字段在快照中缺失或为 `null` 时，除 `IS_NULL`/`IS_NOT_NULL` 外所有运算符返回 `false`
//! - 字符串比较区分大小写

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use fleet_core::models::device::{ATTRIBUTE_PREFIX, BUILTIN_FIELDS};
use fleet_core::{DeviceGroup, DeviceSnapshot, FleetError, FleetResult, MatchType, Rule, RuleOperator};

/// 编译后的规则条件
#[derive(Debug, Clone)]
pub enum RuleCondition {
    Equals(String),
    NotEquals(String),
    Contains(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
    GreaterThan(String),
    GreaterThanOrEqual(String),
    LessThan(String),
    LessThanOrEqual(String),
    Regex(Regex),
    In(Vec<String>),
    NotIn(Vec<String>),
    IsNull,
    IsNotNull,
}

/// 编译后的单条规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub field: String,
    pub condition: RuleCondition,
}

/// 编译后的分组规则集
#[derive(Debug, Clone)]
pub struct CompiledGroup {
    pub match_type: MatchType,
    rules: Vec<CompiledRule>,
}

/// 字段名是否属于可匹配的字段目录
///
/// 目录包括内置字段、`attributes.` 前缀的自定义属性以及点分隔的参数路径
/// （例如 `Device.DeviceInfo.HardwareVersion`）。
pub fn is_known_field(field: &str) -> bool {
    if BUILTIN_FIELDS.contains(&field) {
        return true;
    }
    if let Some(name) = field.strip_prefix(ATTRIBUTE_PREFIX) {
        return !name.is_empty();
    }
    is_parameter_path(field)
}

fn is_parameter_path(field: &str) -> bool {
    field.contains('.')
        && field.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

impl CompiledRule {
    pub fn compile(rule: &Rule) -> FleetResult<Self> {
        if !is_known_field(&rule.field) {
            return Err(FleetError::UnknownField(rule.field.clone()));
        }

        let value = || {
            rule.value.clone().ok_or_else(|| {
                FleetError::InvalidRule(format!(
                    "字段 {} 的运算符 {} 需要比较值",
                    rule.field, rule.operator
                ))
            })
        };

        let condition = match rule.operator {
            RuleOperator::IsNull => RuleCondition::IsNull,
            RuleOperator::IsNotNull => RuleCondition::IsNotNull,
            RuleOperator::Equals => RuleCondition::Equals(value()?),
            RuleOperator::NotEquals => RuleCondition::NotEquals(value()?),
            RuleOperator::Contains => RuleCondition::Contains(value()?),
            RuleOperator::NotContains => RuleCondition::NotContains(value()?),
            RuleOperator::StartsWith => RuleCondition::StartsWith(value()?),
            RuleOperator::EndsWith => RuleCondition::EndsWith(value()?),
            RuleOperator::GreaterThan => RuleCondition::GreaterThan(value()?),
            RuleOperator::GreaterThanOrEqual => RuleCondition::GreaterThanOrEqual(value()?),
            RuleOperator::LessThan => RuleCondition::LessThan(value()?),
            RuleOperator::LessThanOrEqual => RuleCondition::LessThanOrEqual(value()?),
            RuleOperator::Regex => {
                let pattern = value()?;
                let regex = Regex::new(&pattern).map_err(|e| {
                    FleetError::InvalidRule(format!("字段 {} 的正则表达式无效: {e}", rule.field))
                })?;
                RuleCondition::Regex(regex)
            }
            RuleOperator::In => RuleCondition::In(parse_list(&rule.field, &value()?)?),
            RuleOperator::NotIn => RuleCondition::NotIn(parse_list(&rule.field, &value()?)?),
        };

        Ok(Self {
            field: rule.field.clone(),
            condition,
        })
    }

    /// 对设备快照求值
    pub fn evaluate(&self, snapshot: &DeviceSnapshot) -> bool {
        match snapshot.get(&self.field).filter(|v| !v.is_null()) {
            Some(value) => evaluate_present(&self.condition, value),
            None => matches!(self.condition, RuleCondition::IsNull),
        }
    }
}

fn evaluate_present(condition: &RuleCondition, value: &Value) -> bool {
    let text = value_text(value);

    match condition {
        RuleCondition::IsNull => false,
        RuleCondition::IsNotNull => true,
        RuleCondition::Equals(expected) => values_equal(value, &text, expected),
        RuleCondition::NotEquals(expected) => !values_equal(value, &text, expected),
        RuleCondition::Contains(expected) => text.contains(expected.as_str()),
        RuleCondition::NotContains(expected) => !text.contains(expected.as_str()),
        RuleCondition::StartsWith(expected) => text.starts_with(expected.as_str()),
        RuleCondition::EndsWith(expected) => text.ends_with(expected.as_str()),
        RuleCondition::GreaterThan(expected) => compare_values(value, expected).is_gt(),
        RuleCondition::GreaterThanOrEqual(expected) => compare_values(value, expected).is_ge(),
        RuleCondition::LessThan(expected) => compare_values(value, expected).is_lt(),
        RuleCondition::LessThanOrEqual(expected) => compare_values(value, expected).is_le(),
        RuleCondition::Regex(regex) => regex.is_match(&text),
        RuleCondition::In(list) => list.iter().any(|item| item == &text),
        RuleCondition::NotIn(list) => !list.iter().any(|item| item == &text),
    }
}

fn parse_list(field: &str, raw: &str) -> FleetResult<Vec<String>> {
    let parsed: Value = serde_json::from_str(raw).map_err(|e| {
        FleetError::InvalidRule(format!("字段 {field} 的列表值不是有效的JSON: {e}"))
    })?;

    match parsed {
        Value::Array(items) => Ok(items.iter().map(value_text).collect()),
        _ => Err(FleetError::InvalidRule(format!(
            "字段 {field} 的列表值必须是JSON数组"
        ))),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(value: &Value, text: &str, expected: &str) -> bool {
    if text == expected {
        return true;
    }
    // 数值字段允许 "5" 与 5.0 相等
    if value.is_number() {
        if let (Some(actual), Ok(expected)) = (value.as_f64(), expected.parse::<f64>()) {
            return actual == expected;
        }
    }
    false
}

/// 排序比较
///
/// JSON 数值按数值比较；字符串先按版本号分段比较（`1.10` 大于 `1.9`），
/// 其次尝试数值，最后按字典序。
pub fn compare_values(actual: &Value, expected: &str) -> Ordering {
    let text = value_text(actual);

    if let (Some(a), Ok(b)) = (actual.as_f64(), expected.trim().parse::<f64>()) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return ordering;
        }
    }

    if let (Some(a), Some(b)) = (version_segments(&text), version_segments(expected)) {
        let len = a.len().max(b.len());
        for i in 0..len {
            let left = a.get(i).copied().unwrap_or(0);
            let right = b.get(i).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        return Ordering::Equal;
    }

    if let (Ok(a), Ok(b)) = (text.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        if let Some(ordering) = a.partial_cmp(&b) {
            return ordering;
        }
    }

    text.as_str().cmp(expected)
}

fn version_segments(value: &str) -> Option<Vec<u64>> {
    let trimmed = value.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .split('.')
        .map(|segment| segment.parse::<u64>().ok())
        .collect()
}

impl CompiledGroup {
    /// 按 `position` 顺序编译规则
    pub fn compile(match_type: MatchType, rules: &[Rule]) -> FleetResult<Self> {
        let mut ordered: Vec<&Rule> = rules.iter().collect();
        ordered.sort_by_key(|rule| (rule.position, rule.id));

        let rules = ordered
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<FleetResult<Vec<_>>>()?;

        Ok(Self { match_type, rules })
    }

    pub fn from_group(group: &DeviceGroup) -> FleetResult<Self> {
        Self::compile(group.match_type, &group.rules)
    }

    /// 没有规则的分组不匹配任何设备
    pub fn matches(&self, snapshot: &DeviceSnapshot) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        match self.match_type {
            MatchType::All => self.rules.iter().all(|rule| rule.evaluate(snapshot)),
            MatchType::Any => self.rules.iter().any(|rule| rule.evaluate(snapshot)),
        }
    }

    /// 规则引用的字段
    pub fn referenced_fields(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|rule| rule.field.as_str())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// 对单条规则求值
pub fn evaluate_rule(rule: &Rule, snapshot: &DeviceSnapshot) -> FleetResult<bool> {
    Ok(CompiledRule::compile(rule)?.evaluate(snapshot))
}

/// 对分组求值
pub fn evaluate_group(group: &DeviceGroup, snapshot: &DeviceSnapshot) -> FleetResult<bool> {
    Ok(CompiledGroup::from_group(group)?.matches(snapshot))
}

/// 校验规则列表，用于分组创建和更新
pub fn validate_rules(rules: &[Rule]) -> FleetResult<()> {
    for rule in rules {
        CompiledRule::compile(rule)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> DeviceSnapshot {
        let mut snapshot = DeviceSnapshot::new();
        snapshot.insert("manufacturer".to_string(), json!("Acme"));
        snapshot.insert("model".to_string(), json!("X100"));
        snapshot.insert("firmware_version".to_string(), json!("1.10.2"));
        snapshot.insert("online".to_string(), json!(true));
        snapshot.insert("parent_device_id".to_string(), Value::Null);
        snapshot.insert("attributes.uptime".to_string(), json!(3600));
        snapshot.insert("Device.DeviceInfo.HardwareVersion".to_string(), json!("HW2"));
        snapshot
    }

    fn rule(field: &str, operator: RuleOperator, value: Option<&str>) -> Rule {
        Rule::new(field, operator, value)
    }

    #[test]
    fn test_null_operators_ignore_value() {
        let snap = snapshot();
        assert!(evaluate_rule(&rule("parent_device_id", RuleOperator::IsNull, Some("garbage")), &snap).unwrap());
        assert!(evaluate_rule(&rule("xmpp_jid", RuleOperator::IsNull, None), &snap).unwrap());
        assert!(evaluate_rule(&rule("model", RuleOperator::IsNotNull, Some("[not json")), &snap).unwrap());
        assert!(!evaluate_rule(&rule("model", RuleOperator::IsNull, None), &snap).unwrap());
    }

    #[test]
    fn test_absent_field_is_false_for_every_value_operator() {
        let snap = snapshot();
        let operators = [
            (RuleOperator::Equals, "x"),
            (RuleOperator::NotEquals, "x"),
            (RuleOperator::Contains, "x"),
            (RuleOperator::NotContains, "x"),
            (RuleOperator::StartsWith, "x"),
            (RuleOperator::EndsWith, "x"),
            (RuleOperator::GreaterThan, "1"),
            (RuleOperator::GreaterThanOrEqual, "1"),
            (RuleOperator::LessThan, "1"),
            (RuleOperator::LessThanOrEqual, "1"),
            (RuleOperator::Regex, ".*"),
            (RuleOperator::In, r#"["x"]"#),
            (RuleOperator::NotIn, r#"["x"]"#),
        ];
        for (operator, value) in operators {
            let result = evaluate_rule(&rule("parent_device_id", operator, Some(value)), &snap);
            assert!(!result.unwrap(), "{operator} 对缺失字段应返回 false");

            let result = evaluate_rule(&rule("attributes.missing", operator, Some(value)), &snap);
            assert!(!result.unwrap(), "{operator} 对未上报属性应返回 false");
        }
    }

    #[test]
    fn test_unknown_field_is_error() {
        let err = evaluate_rule(&rule("colour", RuleOperator::Equals, Some("red")), &snapshot())
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownField(field) if field == "colour"));
    }

    #[test]
    fn test_malformed_values_are_errors() {
        let snap = snapshot();
        assert!(matches!(
            evaluate_rule(&rule("model", RuleOperator::Regex, Some("X(")), &snap),
            Err(FleetError::InvalidRule(_))
        ));
        assert!(matches!(
            evaluate_rule(&rule("model", RuleOperator::In, Some("X100")), &snap),
            Err(FleetError::InvalidRule(_))
        ));
        assert!(matches!(
            evaluate_rule(&rule("model", RuleOperator::NotIn, Some(r#"{"a":1}"#)), &snap),
            Err(FleetError::InvalidRule(_))
        ));
        assert!(matches!(
            evaluate_rule(&rule("model", RuleOperator::Equals, None), &snap),
            Err(FleetError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_string_operators_are_case_sensitive() {
        let snap = snapshot();
        assert!(evaluate_rule(&rule("manufacturer", RuleOperator::Equals, Some("Acme")), &snap).unwrap());
        assert!(!evaluate_rule(&rule("manufacturer", RuleOperator::Equals, Some("acme")), &snap).unwrap());
        assert!(evaluate_rule(&rule("model", RuleOperator::StartsWith, Some("X1")), &snap).unwrap());
        assert!(!evaluate_rule(&rule("model", RuleOperator::Contains, Some("x1")), &snap).unwrap());
        assert!(evaluate_rule(&rule("model", RuleOperator::EndsWith, Some("100")), &snap).unwrap());
        assert!(evaluate_rule(&rule("model", RuleOperator::NotContains, Some("Y")), &snap).unwrap());
    }

    #[test]
    fn test_ordering_uses_numbers_then_versions() {
        let snap = snapshot();
        assert!(evaluate_rule(&rule("attributes.uptime", RuleOperator::GreaterThan, Some("600")), &snap).unwrap());
        assert!(evaluate_rule(&rule("attributes.uptime", RuleOperator::LessThanOrEqual, Some("3600")), &snap).unwrap());
        // 1.10.2 在版本语义下大于 1.9
        assert!(evaluate_rule(&rule("firmware_version", RuleOperator::GreaterThan, Some("1.9")), &snap).unwrap());
        assert!(evaluate_rule(&rule("firmware_version", RuleOperator::GreaterThanOrEqual, Some("1.10.2")), &snap).unwrap());
        assert!(!evaluate_rule(&rule("firmware_version", RuleOperator::LessThan, Some("1.10")), &snap).unwrap());
    }

    #[test]
    fn test_set_membership_and_regex() {
        let snap = snapshot();
        assert!(evaluate_rule(&rule("model", RuleOperator::In, Some(r#"["X100","X200"]"#)), &snap).unwrap());
        assert!(evaluate_rule(&rule("model", RuleOperator::NotIn, Some(r#"["X200"]"#)), &snap).unwrap());
        assert!(evaluate_rule(&rule("attributes.uptime", RuleOperator::In, Some("[3600, 7200]")), &snap).unwrap());
        assert!(evaluate_rule(&rule("Device.DeviceInfo.HardwareVersion", RuleOperator::Regex, Some("^HW[0-9]$")), &snap).unwrap());
        assert!(evaluate_rule(&rule("online", RuleOperator::Equals, Some("true")), &snap).unwrap());
        assert!(evaluate_rule(&rule("attributes.uptime", RuleOperator::Equals, Some("3600.0")), &snap).unwrap());
    }

    #[test]
    fn test_group_with_zero_rules_matches_nothing() {
        let snap = snapshot();
        let all = DeviceGroup::new("empty-all", MatchType::All);
        let any = DeviceGroup::new("empty-any", MatchType::Any);
        assert!(!evaluate_group(&all, &snap).unwrap());
        assert!(!evaluate_group(&any, &snap).unwrap());
    }

    #[test]
    fn test_group_conjunction_and_disjunction() {
        let snap = snapshot();
        let all = DeviceGroup::new("all", MatchType::All)
            .with_rule(rule("manufacturer", RuleOperator::Equals, Some("Acme")))
            .with_rule(rule("model", RuleOperator::Equals, Some("X200")));
        assert!(!evaluate_group(&all, &snap).unwrap());

        let any = DeviceGroup::new("any", MatchType::Any)
            .with_rule(rule("model", RuleOperator::Equals, Some("X200")))
            .with_rule(rule("manufacturer", RuleOperator::Equals, Some("Acme")));
        assert!(evaluate_group(&any, &snap).unwrap());
    }

    #[test]
    fn test_field_catalog() {
        assert!(is_known_field("firmware_version"));
        assert!(is_known_field("attributes.region"));
        assert!(is_known_field("InternetGatewayDevice.DeviceInfo.SoftwareVersion"));
        assert!(!is_known_field("attributes."));
        assert!(!is_known_field("region"));
        assert!(!is_known_field("Device..Info"));
    }
}
