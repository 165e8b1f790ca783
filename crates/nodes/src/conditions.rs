//! Boolean condition trees evaluated against a contact attribute snapshot.
//!
//! Groups and leaves share the `operator` key:
//!
//! ```json
//! { "operator": "and", "children": [
//!     { "operator": "equals", "field": "country", "value": "US" },
//!     { "operator": "is_set", "field": "phone" } ] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ContactAttributes;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", rename_all = "snake_case")]
pub enum Condition {
    And { children: Vec<Condition> },
    Or { children: Vec<Condition> },
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    Contains { field: String, value: Value },
    NotContains { field: String, value: Value },
    StartsWith { field: String, value: Value },
    EndsWith { field: String, value: Value },
    GreaterThan { field: String, value: Value },
    LessThan { field: String, value: Value },
    IsSet { field: String },
    IsNotSet { field: String },
}

impl Condition {
    /// Evaluate the tree. Missing attributes only satisfy `not_equals`,
    /// `not_contains` and `is_not_set`.
    pub fn evaluate(&self, attributes: &ContactAttributes) -> bool {
        match self {
            Self::And { children } => children.iter().all(|c| c.evaluate(attributes)),
            Self::Or { children } => children.iter().any(|c| c.evaluate(attributes)),
            Self::Equals { field, value } => {
                lookup(attributes, field).is_some_and(|actual| loosely_equal(actual, value))
            }
            Self::NotEquals { field, value } => {
                !lookup(attributes, field).is_some_and(|actual| loosely_equal(actual, value))
            }
            Self::Contains { field, value } => {
                lookup(attributes, field).is_some_and(|actual| contains(actual, value))
            }
            Self::NotContains { field, value } => {
                !lookup(attributes, field).is_some_and(|actual| contains(actual, value))
            }
            Self::StartsWith { field, value } => lookup(attributes, field)
                .is_some_and(|actual| text(actual).starts_with(&text(value))),
            Self::EndsWith { field, value } => lookup(attributes, field)
                .is_some_and(|actual| text(actual).ends_with(&text(value))),
            Self::GreaterThan { field, value } => lookup(attributes, field)
                .is_some_and(|actual| compare(actual, value) == Some(std::cmp::Ordering::Greater)),
            Self::LessThan { field, value } => lookup(attributes, field)
                .is_some_and(|actual| compare(actual, value) == Some(std::cmp::Ordering::Less)),
            Self::IsSet { field } => lookup(attributes, field).is_some(),
            Self::IsNotSet { field } => lookup(attributes, field).is_none(),
        }
    }
}

/// `null` and `""` count as unset.
fn lookup<'a>(attributes: &'a ContactAttributes, field: &str) -> Option<&'a Value> {
    match attributes.get(field)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(other),
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => text(actual) == text(expected),
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        other => text(other).contains(&text(needle)),
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(text(actual).cmp(&text(expected))),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
