//! Schema compilation and value coercion.
//!
//! Coercion rules:
//! - absent value + schema `default` → adopt the default (deeply for objects)
//! - `integer: true` → fractional numerics round to the nearest integer
//! - `enum` restricts accepted values
//! - objects require every `required` key *after* defaults are applied
//! - unknown properties are preserved unless `additionalProperties: false`,
//!   in which case validation fails naming the offending key
//!
//! Validators are pure and idempotent on their own output.

use serde_json::{Map, Value};

use super::schema::{
    ArraySchema, BooleanSchema, NumberSchema, ObjectSchema, ParserSchema, StringSchema,
};

/// A structured validation failure, pointing at the offending path.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

/// A compiled schema, ready to validate candidates.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: ParserSchema,
}

/// Compile a schema into a validator.
pub fn compile(schema: &ParserSchema) -> Validator {
    Validator {
        schema: schema.clone(),
    }
}

impl Validator {
    /// Validate a candidate, producing the coerced value. `None` means the
    /// value is absent (distinct from JSON `null`, which only `unknown`
    /// accepts).
    pub fn validate(&self, value: Option<&Value>) -> Result<Value, ValidationIssue> {
        validate_at(&self.schema, value, "$")
    }
}

fn validate_at(
    schema: &ParserSchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    match schema {
        ParserSchema::Unknown => Ok(value.cloned().unwrap_or(Value::Null)),
        ParserSchema::String(s) => validate_string(s, value, path),
        ParserSchema::Number(s) => validate_number(s, value, path),
        ParserSchema::Boolean(s) => validate_boolean(s, value, path),
        ParserSchema::Array(s) => validate_array(s, value, path),
        ParserSchema::Object(s) => validate_object(s, value, path),
    }
}

fn validate_string(
    schema: &StringSchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    let text = match value {
        None | Some(Value::Null) => schema
            .default
            .clone()
            .ok_or_else(|| ValidationIssue::new(path, "missing value, expected string"))?,
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(ValidationIssue::new(
                path,
                format!("expected string, got {}", type_name(other)),
            ))
        }
    };

    if let Some(choices) = &schema.choices {
        if !choices.contains(&text) {
            return Err(ValidationIssue::new(
                path,
                format!("{text:?} is not one of {choices:?}"),
            ));
        }
    }
    if let Some(min) = schema.min_length {
        if text.chars().count() < min {
            return Err(ValidationIssue::new(path, format!("shorter than {min} chars")));
        }
    }
    if let Some(max) = schema.max_length {
        if text.chars().count() > max {
            return Err(ValidationIssue::new(path, format!("longer than {max} chars")));
        }
    }
    Ok(Value::String(text))
}

fn validate_number(
    schema: &NumberSchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    let number = match value {
        None | Some(Value::Null) => schema
            .default
            .ok_or_else(|| ValidationIssue::new(path, "missing value, expected number"))?,
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ValidationIssue::new(path, "number out of range"))?,
        Some(other) => {
            return Err(ValidationIssue::new(
                path,
                format!("expected number, got {}", type_name(other)),
            ))
        }
    };

    let number = if schema.integer { number.round() } else { number };

    if let Some(choices) = &schema.choices {
        if !choices.iter().any(|c| *c == number) {
            return Err(ValidationIssue::new(
                path,
                format!("{number} is not one of {choices:?}"),
            ));
        }
    }
    if let Some(min) = schema.min {
        if number < min {
            return Err(ValidationIssue::new(path, format!("below minimum {min}")));
        }
    }
    if let Some(max) = schema.max {
        if number > max {
            return Err(ValidationIssue::new(path, format!("above maximum {max}")));
        }
    }

    if schema.integer {
        Ok(Value::Number((number as i64).into()))
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .ok_or_else(|| ValidationIssue::new(path, "number is not finite"))
    }
}

fn validate_boolean(
    schema: &BooleanSchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    match value {
        None | Some(Value::Null) => schema
            .default
            .map(Value::Bool)
            .ok_or_else(|| ValidationIssue::new(path, "missing value, expected boolean")),
        Some(Value::Bool(b)) => Ok(Value::Bool(*b)),
        Some(other) => Err(ValidationIssue::new(
            path,
            format!("expected boolean, got {}", type_name(other)),
        )),
    }
}

fn validate_array(
    schema: &ArraySchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    let items: Vec<Value> = match value {
        None | Some(Value::Null) => schema
            .default
            .clone()
            .ok_or_else(|| ValidationIssue::new(path, "missing value, expected array"))?,
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(ValidationIssue::new(
                path,
                format!("expected array, got {}", type_name(other)),
            ))
        }
    };

    if let Some(min) = schema.min_items {
        if items.len() < min {
            return Err(ValidationIssue::new(path, format!("fewer than {min} items")));
        }
    }
    if let Some(max) = schema.max_items {
        if items.len() > max {
            return Err(ValidationIssue::new(path, format!("more than {max} items")));
        }
    }

    let coerced = items
        .iter()
        .enumerate()
        .map(|(i, item)| validate_at(&schema.items, Some(item), &format!("{path}[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(coerced))
}

fn validate_object(
    schema: &ObjectSchema,
    value: Option<&Value>,
    path: &str,
) -> Result<Value, ValidationIssue> {
    let incoming: Map<String, Value> = match value {
        None | Some(Value::Null) => schema.default.clone().unwrap_or_default(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(ValidationIssue::new(
                path,
                format!("expected object, got {}", type_name(other)),
            ))
        }
    };

    let mut out = Map::new();
    for (key, sub) in &schema.properties {
        let child_path = format!("{path}.{key}");
        match incoming.get(key) {
            Some(v) => {
                out.insert(key.clone(), validate_at(sub, Some(v), &child_path)?);
            }
            None => {
                if let Some(default) = deep_default(sub) {
                    out.insert(key.clone(), default);
                } else if schema.required.iter().any(|r| r == key) {
                    return Err(ValidationIssue::new(&child_path, "required key missing"));
                }
            }
        }
    }

    for (key, v) in &incoming {
        if schema.properties.contains_key(key) {
            continue;
        }
        if !schema.allows_additional() {
            return Err(ValidationIssue::new(
                path,
                format!("unknown property {key:?}"),
            ));
        }
        out.insert(key.clone(), v.clone());
    }

    Ok(Value::Object(out))
}

/// The value an absent candidate coerces to, if the schema can supply one.
/// Objects without an explicit default assemble one from their properties'
/// defaults, as long as every required property is covered.
fn deep_default(schema: &ParserSchema) -> Option<Value> {
    match schema {
        ParserSchema::Unknown => None,
        ParserSchema::String(s) => s.default.clone().map(Value::String),
        ParserSchema::Number(s) => s.default.map(|n| {
            if s.integer {
                Value::Number((n.round() as i64).into())
            } else {
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }),
        ParserSchema::Boolean(s) => s.default.map(Value::Bool),
        ParserSchema::Array(s) => s.default.clone().map(Value::Array),
        ParserSchema::Object(s) => {
            if let Some(map) = &s.default {
                return Some(Value::Object(map.clone()));
            }
            let mut out = Map::new();
            for (key, sub) in &s.properties {
                match deep_default(sub) {
                    Some(v) => {
                        out.insert(key.clone(), v);
                    }
                    None if s.required.iter().any(|r| r == key) => return None,
                    None => {}
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object_schema(spec: Value) -> ParserSchema {
        serde_json::from_value(spec).unwrap()
    }

    #[test]
    fn test_defaults_applied_deeply() {
        let schema = object_schema(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "options": {
                    "type": "object",
                    "properties": {
                        "retries": { "type": "number", "integer": true, "default": 2 },
                        "verbose": { "type": "boolean", "default": false }
                    }
                }
            },
            "required": ["name"]
        }));
        let validator = compile(&schema);
        let coerced = validator.validate(Some(&json!({ "name": "run" }))).unwrap();
        assert_eq!(
            coerced,
            json!({ "name": "run", "options": { "retries": 2, "verbose": false } })
        );
    }

    #[test]
    fn test_required_after_defaults() {
        let schema = object_schema(json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "default": "fast" },
                "target": { "type": "string" }
            },
            "required": ["mode", "target"]
        }));
        let err = compile(&schema).validate(Some(&json!({}))).unwrap_err();
        assert_eq!(err.path, "$.target");
    }

    #[test]
    fn test_integer_rounding() {
        let schema: ParserSchema =
            serde_json::from_value(json!({ "type": "number", "integer": true })).unwrap();
        assert_eq!(compile(&schema).validate(Some(&json!(2.6))).unwrap(), json!(3));
        assert_eq!(compile(&schema).validate(Some(&json!(4))).unwrap(), json!(4));
    }

    #[test]
    fn test_enum_restricts() {
        let schema: ParserSchema = serde_json::from_value(
            json!({ "type": "string", "enum": ["instruct", "approve", "fail"] }),
        )
        .unwrap();
        assert!(compile(&schema).validate(Some(&json!("approve"))).is_ok());
        assert!(compile(&schema).validate(Some(&json!("retry"))).is_err());
    }

    #[test]
    fn test_additional_properties() {
        let open = object_schema(json!({
            "type": "object",
            "properties": { "a": { "type": "string" } }
        }));
        let coerced = compile(&open)
            .validate(Some(&json!({ "a": "x", "extra": 1 })))
            .unwrap();
        assert_eq!(coerced, json!({ "a": "x", "extra": 1 }));

        let closed = object_schema(json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": false
        }));
        let err = compile(&closed)
            .validate(Some(&json!({ "a": "x", "extra": 1 })))
            .unwrap_err();
        assert!(err.message.contains("extra"));
    }

    #[test]
    fn test_unknown_passes_through() {
        let validator = compile(&ParserSchema::Unknown);
        assert_eq!(
            validator.validate(Some(&json!({ "free": ["form"] }))).unwrap(),
            json!({ "free": ["form"] })
        );
        assert_eq!(validator.validate(None).unwrap(), Value::Null);
    }

    #[test]
    fn test_idempotent() {
        let schema = object_schema(json!({
            "type": "object",
            "properties": {
                "n": { "type": "number", "integer": true, "default": 1.2 },
                "tags": { "type": "array", "items": { "type": "string" }, "default": [] }
            }
        }));
        let validator = compile(&schema);
        let once = validator.validate(Some(&json!({ "n": 3.7 }))).unwrap();
        let twice = validator.validate(Some(&once)).unwrap();
        assert_eq!(once, twice);
    }
}
