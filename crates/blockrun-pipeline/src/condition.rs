//! Declarative conditions: `{path, operator, value?}` evaluated against a record.
//!
//! A list of conditions is a conjunction; there is no OR and no nesting. An
//! empty list is always true.

use std::cmp::Ordering;
use std::str::FromStr;

use blockrun_types::{BlockrunError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::path::get_path;

static NULL: Value = Value::Null;

/// A single condition. `value` distinguishes "absent" from an explicit
/// `null`, so `{"operator": "equals", "value": null}` is a valid comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub path: String,
    pub operator: String,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

impl Condition {
    /// The parsed operator, failing when it is unknown or lacks a required
    /// operand.
    pub fn checked_operator(&self) -> Result<Operator> {
        let op: Operator = self.operator.parse()?;
        if op.requires_value() && self.value.is_none() {
            return Err(BlockrunError::MissingOperand {
                operator: self.operator.clone(),
            });
        }
        Ok(op)
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    MinLength,
    MaxLength,
    Matches,
    NotMatches,
    IsNull,
    IsNotNull,
    IsDefined,
    IsUndefined,
    IsTrue,
    IsFalse,
    IsEmpty,
    IsNotEmpty,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "notEquals",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::NotContains => "notContains",
            Operator::MinLength => "minLength",
            Operator::MaxLength => "maxLength",
            Operator::Matches => "matches",
            Operator::NotMatches => "notMatches",
            Operator::IsNull => "isNull",
            Operator::IsNotNull => "isNotNull",
            Operator::IsDefined => "isDefined",
            Operator::IsUndefined => "isUndefined",
            Operator::IsTrue => "isTrue",
            Operator::IsFalse => "isFalse",
            Operator::IsEmpty => "isEmpty",
            Operator::IsNotEmpty => "isNotEmpty",
        }
    }

    /// Whether the operator compares against an operand.
    pub fn requires_value(self) -> bool {
        !matches!(
            self,
            Operator::IsNull
                | Operator::IsNotNull
                | Operator::IsDefined
                | Operator::IsUndefined
                | Operator::IsTrue
                | Operator::IsFalse
                | Operator::IsEmpty
                | Operator::IsNotEmpty
        )
    }
}

impl FromStr for Operator {
    type Err = BlockrunError;

    fn from_str(s: &str) -> Result<Self> {
        let op = match s {
            "equals" => Operator::Equals,
            "notEquals" => Operator::NotEquals,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "contains" => Operator::Contains,
            "notContains" => Operator::NotContains,
            "minLength" => Operator::MinLength,
            "maxLength" => Operator::MaxLength,
            "matches" => Operator::Matches,
            "notMatches" => Operator::NotMatches,
            "isNull" => Operator::IsNull,
            "isNotNull" => Operator::IsNotNull,
            "isDefined" => Operator::IsDefined,
            "isUndefined" => Operator::IsUndefined,
            "isTrue" => Operator::IsTrue,
            "isFalse" => Operator::IsFalse,
            "isEmpty" => Operator::IsEmpty,
            "isNotEmpty" => Operator::IsNotEmpty,
            other => return Err(BlockrunError::UnknownOperator(other.to_string())),
        };
        Ok(op)
    }
}

/// Apply `operator` to `value` (`None` = undefined) and the operand.
pub fn evaluate_operator(value: Option<&Value>, operator: &str, expected: Option<&Value>) -> Result<bool> {
    let op: Operator = operator.parse()?;
    let expected = match (op.requires_value(), expected) {
        (true, None) => {
            return Err(BlockrunError::MissingOperand {
                operator: operator.to_string(),
            })
        }
        (_, Some(e)) => e,
        (false, None) => &NULL,
    };

    let result = match op {
        Operator::Equals => value.is_some_and(|v| values_equal(v, expected)),
        Operator::NotEquals => !value.is_some_and(|v| values_equal(v, expected)),
        Operator::Gt => compare(value, expected) == Some(Ordering::Greater),
        Operator::Gte => matches!(compare(value, expected), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => compare(value, expected) == Some(Ordering::Less),
        Operator::Lte => matches!(compare(value, expected), Some(Ordering::Less | Ordering::Equal)),
        Operator::Contains => match value {
            Some(Value::String(s)) => s.contains(&stringify(expected)),
            Some(Value::Array(items)) => items.iter().any(|item| {
                values_equal(item, expected)
                    || matches!((item, expected), (Value::String(i), Value::String(e)) if i.contains(e.as_str()))
            }),
            _ => false,
        },
        Operator::NotContains => match value {
            Some(Value::String(s)) => !s.contains(&stringify(expected)),
            Some(Value::Array(items)) => !items.iter().any(|item| values_equal(item, expected)),
            _ => true,
        },
        Operator::MinLength => length(value).is_some_and(|len| len as f64 >= as_number(expected)),
        Operator::MaxLength => length(value).is_some_and(|len| len as f64 <= as_number(expected)),
        Operator::Matches => match value {
            Some(Value::String(s)) => compile(expected)?.is_match(s),
            _ => false,
        },
        Operator::NotMatches => match value {
            Some(Value::String(s)) => !compile(expected)?.is_match(s),
            _ => true,
        },
        Operator::IsNull => matches!(value, Some(Value::Null)),
        Operator::IsNotNull => !matches!(value, Some(Value::Null)),
        Operator::IsDefined => value.is_some(),
        Operator::IsUndefined => value.is_none(),
        Operator::IsTrue => matches!(value, Some(Value::Bool(true))),
        Operator::IsFalse => matches!(value, Some(Value::Bool(false))),
        Operator::IsEmpty => is_empty(value),
        Operator::IsNotEmpty => !is_empty(value),
    };
    Ok(result)
}

/// Evaluate one condition against `data`.
pub fn evaluate_condition(data: &Value, condition: &Condition) -> Result<bool> {
    let value = get_path(data, &condition.path);
    evaluate_operator(value, &condition.operator, condition.value.as_ref())
}

/// `true` iff every condition holds. Stops at the first false condition.
pub fn evaluate_all(data: &Value, conditions: &[Condition]) -> Result<bool> {
    for condition in conditions {
        if !evaluate_condition(data, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate a raw JSON list of conditions. Fails if `conditions` is not an
/// array or an entry is not a valid condition.
pub fn evaluate_conditions(data: &Value, conditions: &Value) -> Result<bool> {
    evaluate_all(data, &parse_conditions(conditions)?)
}

/// Parse a raw JSON list of conditions.
pub fn parse_conditions(conditions: &Value) -> Result<Vec<Condition>> {
    let Value::Array(items) = conditions else {
        return Err(BlockrunError::InvalidCondition(
            "conditions must be a list".into(),
        ));
    };
    items
        .iter()
        .map(|item| {
            Condition::deserialize(item)
                .map_err(|e| BlockrunError::InvalidCondition(format!("{item}: {e}")))
        })
        .collect()
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Order two values the way a loose native comparison would: numbers
/// numerically, strings lexically, a number against a numeric string
/// numerically. Anything else is unordered.
fn compare(value: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (value?, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) => numeric(a)?.partial_cmp(&numeric(b)?),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A count or duration given as a number or a numeric string, as a whole
/// number. Fractions truncate and negatives clamp to zero.
pub(crate) fn whole_number(value: &Value) -> Option<u64> {
    numeric(value)
        .filter(|n| n.is_finite())
        .map(|n| n.max(0.0) as u64)
}

fn as_number(value: &Value) -> f64 {
    numeric(value).unwrap_or(f64::NAN)
}

fn length(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

fn compile(pattern: &Value) -> Result<Regex> {
    let pattern = stringify(pattern);
    Regex::new(&pattern).map_err(|e| BlockrunError::InvalidPattern {
        pattern,
        message: e.to_string(),
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
