//! Dotted-path lookup over a JSON scope.
//!
//! The scope is the read-only binding environment used by the template
//! renderer and the condition evaluator: a JSON object with keys like
//! `user`, `run`, `round`, `state`, `steps`, `parsed`, `args`.

use serde_json::Value;

/// Scope prefixes a path may start with. Which keys are actually bound
/// depends on the phase (e.g. `parsed` only exists after a step ran).
pub const SCOPE_PREFIXES: &[&str] = &[
    "user", "run", "round", "maxRounds", "state", "steps", "parsed", "args",
];

/// Resolve a dotted path (`steps.plan.parsed.status`) against a scope.
/// Array elements are addressed by numeric segment. Returns `None` when
/// any segment is missing.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = scope;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let index: usize = segment.parse().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}

/// Whether a looked-up value counts as defined. JSON `null` does not.
pub fn is_defined(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

/// Stringify a scope value the way templates see it: strings verbatim,
/// everything else as canonical JSON (object keys sorted).
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce a scope value to a number for ordering comparators. Numeric
/// strings parse (the state bag holds strings only).
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
