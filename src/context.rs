// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Context Matcher: evaluates a structured [`ContextFilter`] against a
//! [`CoatyObject`], used by Call receivers to gate remote-operation execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::object::CoatyObject;

/// A single `[propertyPath, operator, operand]` condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-separated property path into the object, e.g. `"location.floor"`.
    pub property: String,
    /// Comparison operator to apply.
    pub operator: Operator,
    /// Operand(s) the property value is compared against. Absent for
    /// [`Operator::Exists`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand: Option<Value>,
}

/// Supported comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    /// Property value equals the operand.
    Equals,
    /// Property value does not equal the operand.
    NotEquals,
    /// Property value is less than the operand.
    LessThan,
    /// Property value is less than or equal to the operand.
    LessThanOrEqual,
    /// Property value is greater than the operand.
    GreaterThan,
    /// Property value is greater than or equal to the operand.
    GreaterThanOrEqual,
    /// Property value lies within an inclusive `[low, high]` range.
    Between,
    /// SQL-style pattern match using `%` and `_` wildcards.
    Like,
    /// Property path is present on the object.
    Exists,
    /// Property value (string or array) contains the operand.
    Contains,
    /// Property value is one of the operand array's elements.
    In,
    /// Property value is none of the operand array's elements.
    NotIn,
}

/// A tree of conjunctions/disjunctions of [`Condition`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextFilter {
    /// A single leaf condition.
    Condition(Condition),
    /// All children must match.
    And(Vec<ContextFilter>),
    /// At least one child must match.
    Or(Vec<ContextFilter>),
}

impl ContextFilter {
    /// Evaluates this filter against `object`. Never panics or errors on a
    /// well-formed filter: a missing property path yields `exists = false`
    /// and every comparison operator returns `false`.
    #[must_use]
    pub fn matches(&self, object: &CoatyObject) -> bool {
        match self {
            ContextFilter::Condition(cond) => cond.matches(object),
            ContextFilter::And(children) => children.iter().all(|c| c.matches(object)),
            ContextFilter::Or(children) => children.iter().any(|c| c.matches(object)),
        }
    }
}

impl Condition {
    fn matches(&self, object: &CoatyObject) -> bool {
        let value = resolve_path(object, &self.property);

        if self.operator == Operator::Exists {
            return value.is_some();
        }

        let Some(value) = value else { return false };
        let value = &value;
        let Some(operand) = &self.operand else { return false };

        match self.operator {
            Operator::Exists => unreachable!("handled above"),
            Operator::Equals => values_equal(value, operand),
            Operator::NotEquals => !values_equal(value, operand),
            Operator::LessThan => compare_numbers(value, operand).is_some_and(|o| o.is_lt()),
            Operator::LessThanOrEqual => compare_numbers(value, operand).is_some_and(|o| o.is_le()),
            Operator::GreaterThan => compare_numbers(value, operand).is_some_and(|o| o.is_gt()),
            Operator::GreaterThanOrEqual => compare_numbers(value, operand).is_some_and(|o| o.is_ge()),
            Operator::Between => match operand.as_array() {
                Some(bounds) if bounds.len() == 2 => {
                    let (Some(v), Some(low), Some(high)) = (value.as_f64(), bounds[0].as_f64(), bounds[1].as_f64()) else {
                        return false;
                    };
                    v >= low && v <= high
                }
                _ => false,
            },
            Operator::Like => match (value.as_str(), operand.as_str()) {
                (Some(v), Some(pattern)) => like_matches(v, pattern),
                _ => false,
            },
            Operator::Contains => match value {
                Value::String(s) => operand.as_str().is_some_and(|needle| s.contains(needle)),
                Value::Array(items) => items.iter().any(|item| values_equal(item, operand)),
                _ => false,
            },
            Operator::In => match operand.as_array() {
                Some(items) => items.iter().any(|item| values_equal(item, value)),
                None => false,
            },
            Operator::NotIn => match operand.as_array() {
                Some(items) => !items.iter().any(|item| values_equal(item, value)),
                None => true,
            },
        }
    }
}

/// Resolves a dot-separated property path against the object's JSON
/// representation, returning an owned leaf value. `core_type`/`objectType`/
/// etc. are reachable the same way as extra fields, since the object is
/// resolved through its serialized form.
fn resolve_path(object: &CoatyObject, path: &str) -> Option<Value> {
    let root = serde_json::to_value(object).ok()?;
    let mut current = &root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b
}

fn compare_numbers(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn like_matches(value: &str, pattern: &str) -> bool {
    let regex_str = sql_like_to_regex(pattern);
    regex::Regex::new(&regex_str).is_ok_and(|re| re.is_match(value))
}

fn sql_like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            c if regex_syntax_needs_escape(c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push('$');
    out
}

fn regex_syntax_needs_escape(c: char) -> bool {
    matches!(c, '.' | '^' | '$' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\')
}
