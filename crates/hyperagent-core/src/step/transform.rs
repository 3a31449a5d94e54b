//! Transform step executor — pure data reshaping between steps.
//!
//! Renders every string leaf of `template` against the scope, optionally
//! extended with the step's validated `input` under the `input` binding.
//! No collaborators are touched; `raw` is the canonical JSON of the
//! rendered tree.

use serde_json::Value;

use crate::engine::RunContext;
use crate::error::WorkflowError;
use crate::parser::{compile, ParserSchema};
use crate::step::StepResult;
use crate::template;

pub(crate) async fn execute(
    ctx: &RunContext,
    key: &str,
    template_tree: &Value,
    input: Option<&Value>,
    input_schema: Option<&ParserSchema>,
) -> Result<StepResult, WorkflowError> {
    let base_scope = ctx.scope();

    let scope = match input {
        Some(tree) => {
            let rendered = template::render_tree(tree, &base_scope)?;
            let validated = match input_schema {
                Some(schema) => compile(schema).validate(Some(&rendered)).map_err(|issue| {
                    WorkflowError::Schema(format!("step '{key}' inputSchema: {issue}"))
                })?,
                None => rendered,
            };
            let mut obj = base_scope.as_object().cloned().unwrap_or_default();
            obj.insert("input".to_string(), validated);
            Value::Object(obj)
        }
        None => base_scope,
    };

    let parsed = template::render_tree(template_tree, &scope)?;
    let raw = parsed.to_string();
    Ok(StepResult::new("transform", key, raw, parsed))
}
