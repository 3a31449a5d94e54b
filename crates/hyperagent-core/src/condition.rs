//! Transition condition DSL and its evaluator.
//!
//! A condition is either the literal `"always"` or a predicate tree:
//! leaves test a scope path against a comparator, composites combine with
//! `all` / `any` / `not`. Evaluation is pure; a missing path yields
//! `undefined`, which no comparator matches except `absent` (and
//! `exists: false`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scope;

/// A transition condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// The literal `"always"`.
    Literal(String),
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Not { not: Box<Condition> },
    Leaf(LeafCondition),
}

/// A leaf predicate. Several comparators on one leaf conjoin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafCondition {
    /// Dotted scope path to test.
    pub field: String,

    /// Strict equality (numbers compare numerically).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,

    /// String containment, or array membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<Value>,

    /// Value is one of the listed literals.
    #[serde(default, rename = "in", skip_serializing_if = "Option::is_none")]
    pub is_in: Option<Vec<Value>>,

    /// Regex match over a string value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,

    /// `true` — path must be defined; `false` — must not be.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,

    /// `true` — path must be undefined; `false` — must be defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absent: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ge: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub le: Option<f64>,
}

/// Evaluate a condition against a scope.
pub fn evaluate(condition: &Condition, scope: &Value) -> bool {
    match condition {
        Condition::Literal(s) => s == "always",
        Condition::All { all } => all.iter().all(|c| evaluate(c, scope)),
        Condition::Any { any } => any.iter().any(|c| evaluate(c, scope)),
        Condition::Not { not } => !evaluate(not, scope),
        Condition::Leaf(leaf) => evaluate_leaf(leaf, scope),
    }
}

fn evaluate_leaf(leaf: &LeafCondition, scope: &Value) -> bool {
    let value = scope::lookup(scope, &leaf.field);
    let defined = scope::is_defined(value);

    if let Some(expected) = leaf.exists {
        if defined != expected {
            return false;
        }
    }
    if let Some(expected) = leaf.absent {
        if defined == expected {
            return false;
        }
    }

    if let Some(target) = &leaf.equals {
        match value {
            Some(v) if values_equal(v, target) => {}
            _ => return false,
        }
    }

    if let Some(needle) = &leaf.includes {
        let holds = match value {
            Some(Value::String(s)) => match needle {
                Value::String(n) => s.contains(n.as_str()),
                other => s.contains(&scope::to_display_string(other)),
            },
            Some(Value::Array(items)) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        };
        if !holds {
            return false;
        }
    }

    if let Some(choices) = &leaf.is_in {
        match value {
            Some(v) if choices.iter().any(|c| values_equal(v, c)) => {}
            _ => return false,
        }
    }

    if let Some(pattern) = &leaf.matches {
        let holds = match (regex::Regex::new(pattern), value) {
            (Ok(re), Some(Value::String(s))) => re.is_match(s),
            (Err(e), _) => {
                // Rejected at document validation; a dynamic condition with
                // a bad pattern simply never matches.
                tracing::debug!("[Condition] Invalid regex {:?}: {}", pattern, e);
                false
            }
            _ => false,
        };
        if !holds {
            return false;
        }
    }

    let number = value.and_then(scope::as_number);
    for (bound, holds) in [
        (leaf.gt, number.map(|n| n > leaf.gt.unwrap_or(0.0))),
        (leaf.ge, number.map(|n| n >= leaf.ge.unwrap_or(0.0))),
        (leaf.lt, number.map(|n| n < leaf.lt.unwrap_or(0.0))),
        (leaf.le, number.map(|n| n <= leaf.le.unwrap_or(0.0))),
    ] {
        if bound.is_some() && !holds.unwrap_or(false) {
            return false;
        }
    }

    true
}

/// Equality with numeric loosening: `3` equals `3.0`; everything else is
/// strict JSON equality.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
