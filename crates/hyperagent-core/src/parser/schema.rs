//! Parser schema types — the compact shape language for agent replies and
//! run inputs.
//!
//! ```json
//! {
//!   "type": "object",
//!   "properties": {
//!     "status": { "type": "string", "enum": ["instruct", "approve", "fail"] },
//!     "confidence": { "type": "number", "integer": true, "min": 0, "max": 100 }
//!   },
//!   "required": ["status"]
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parser schema. The `unknown` variant accepts any value as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParserSchema {
    Unknown,
    String(StringSchema),
    Number(NumberSchema),
    Boolean(BooleanSchema),
    Array(ArraySchema),
    Object(ObjectSchema),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StringSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Accepted values, when restricted.
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<f64>,

    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<f64>>,

    /// Fractional candidates are rounded to the nearest integer.
    #[serde(default)]
    pub integer: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArraySchema {
    pub items: Box<ParserSchema>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSchema {
    #[serde(default)]
    pub properties: BTreeMap<String, ParserSchema>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// Unknown properties are preserved unless this is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Map<String, Value>>,
}

impl ObjectSchema {
    pub fn allows_additional(&self) -> bool {
        self.additional_properties.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tagged_variants() {
        let schema: ParserSchema = serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["ok", "fail"] },
                "count": { "type": "number", "integer": true, "default": 0 }
            },
            "required": ["status"]
        }))
        .unwrap();

        let ParserSchema::Object(obj) = schema else {
            panic!("expected object schema");
        };
        assert_eq!(obj.required, vec!["status"]);
        assert!(matches!(
            obj.properties.get("count"),
            Some(ParserSchema::Number(n)) if n.integer && n.default == Some(0.0)
        ));
    }

    #[test]
    fn test_parse_unknown() {
        let schema: ParserSchema = serde_json::from_value(json!({ "type": "unknown" })).unwrap();
        assert_eq!(schema, ParserSchema::Unknown);
    }

    #[test]
    fn test_roundtrip() {
        let schema: ParserSchema = serde_json::from_value(json!({
            "type": "array",
            "items": { "type": "string", "minLength": 1 },
            "maxItems": 4
        }))
        .unwrap();
        let reparsed: ParserSchema =
            serde_json::from_value(serde_json::to_value(&schema).unwrap()).unwrap();
        assert_eq!(schema, reparsed);
    }
}
