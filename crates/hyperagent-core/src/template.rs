//! Template renderer — evaluates `{{path||fallback}}` expressions over a scope.
//!
//! An expression is a chain of segments separated by `||`. Each segment is
//! either a double-quoted literal (`"fallback"`, `\"` escapes) or a dotted
//! path resolved against the scope. The first segment yielding a defined,
//! non-empty value wins; an empty string counts as defined only when it is
//! a literal. Non-string scope values are stringified as canonical JSON.
//!
//! Rendering is side-effect-free and deterministic for a given scope.

use serde_json::Value;

use crate::error::WorkflowError;
use crate::scope;

/// Render a template string against a scope.
pub fn render(template: &str, scope: &Value) -> Result<String, WorkflowError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let (expression, consumed) = scan_expression(body)
            .ok_or_else(|| WorkflowError::Template(format!("unclosed expression in {template:?}")))?;
        out.push_str(&evaluate(expression, scope)?);
        rest = &body[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Recursively render every string leaf of a JSON-like structure.
pub fn render_tree(value: &Value, scope: &Value) -> Result<Value, WorkflowError> {
    Ok(match value {
        Value::String(s) => Value::String(render(s, scope)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_tree(item, scope))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_tree(v, scope)?)))
                .collect::<Result<_, WorkflowError>>()?,
        ),
        other => other.clone(),
    })
}

/// Find the extent of an expression body, honoring quoted literals so a
/// fallback like `{{x||"}}"}}` closes at the right brace pair. Returns the
/// body slice and the offset just past the closing `}}`.
fn scan_expression(body: &str) -> Option<(&str, usize)> {
    let bytes = body.as_bytes();
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            b'}' if !in_quote && bytes.get(i + 1) == Some(&b'}') => {
                return Some((&body[..i], i + 2));
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn evaluate(expression: &str, scope: &Value) -> Result<String, WorkflowError> {
    if expression.trim().is_empty() {
        return Err(WorkflowError::Template("empty expression".to_string()));
    }

    for segment in split_segments(expression) {
        let segment = segment.trim();
        if segment.is_empty() {
            return Err(WorkflowError::Template(format!(
                "empty segment in expression {expression:?}"
            )));
        }

        if segment.starts_with('"') {
            // Literal fallback: always defined, even when empty.
            return parse_literal(segment);
        }

        match scope::lookup(scope, segment) {
            Some(Value::Null) | None => continue,
            Some(Value::String(s)) if s.is_empty() => continue,
            Some(value) => return Ok(scope::to_display_string(value)),
        }
    }

    // Every segment was undefined and no literal terminated the chain.
    tracing::debug!("[Template] Expression {:?} resolved to nothing", expression);
    Ok(String::new())
}

/// Split an expression on `||`, ignoring separators inside quoted literals.
fn split_segments(expression: &str) -> Vec<&str> {
    let bytes = expression.as_bytes();
    let mut segments = Vec::new();
    let mut in_quote = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quote => i += 1,
            b'"' => in_quote = !in_quote,
            b'|' if !in_quote && bytes.get(i + 1) == Some(&b'|') => {
                segments.push(&expression[start..i]);
                i += 1;
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&expression[start..]);
    segments
}

fn parse_literal(segment: &str) -> Result<String, WorkflowError> {
    let inner = segment
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| {
            WorkflowError::Template(format!("unterminated literal {segment:?}"))
        })?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => {
                    return Err(WorkflowError::Template(format!(
                        "dangling escape in literal {segment:?}"
                    )))
                }
            }
        } else if ch == '"' {
            return Err(WorkflowError::Template(format!(
                "stray quote in literal {segment:?}"
            )));
        } else {
            out.push(ch);
        }
    }
    Ok(out)
}
