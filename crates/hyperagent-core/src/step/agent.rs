//! Agent step executor — one LLM turn in the role's persistent session.
//!
//! Prompts render against the scope snapshot, the role's session is
//! resolved (created lazily on first use), and the reply's last text part
//! becomes `raw`. The role's parser coerces the reply; when the reply is
//! not bare JSON a single extraction pass strips markdown fences and
//! surrounding prose before giving up.

use serde_json::{json, Value};

use crate::engine::RunContext;
use crate::error::WorkflowError;
use crate::parser::{compile, ParserSchema};
use crate::provenance::{AgentRecord, ProvenanceEntry};
use crate::step::StepResult;
use crate::template;

pub(crate) async fn execute(
    ctx: &RunContext,
    key: &str,
    role: &str,
    prompts: &[String],
) -> Result<StepResult, WorkflowError> {
    let spec = ctx
        .document
        .roles
        .get(role)
        .ok_or_else(|| WorkflowError::Schema(format!("unknown role '{role}'")))?;
    let parser = ctx
        .document
        .parsers
        .get(&spec.parser)
        .ok_or_else(|| WorkflowError::Schema(format!("unknown parser '{}'", spec.parser)))?;

    let scope = ctx.scope();
    let parts = prompts
        .iter()
        .map(|p| template::render(p, &scope))
        .collect::<Result<Vec<_>, _>>()?;

    let resolved = ctx
        .sessions
        .session_for(role, spec, ctx.model.as_deref())
        .await?;
    if resolved.created {
        ctx.provenance
            .append(
                &ctx.run_id,
                ProvenanceEntry::Agent(AgentRecord {
                    role: role.to_string(),
                    session_id: resolved.handle.id.clone(),
                    name: resolved.name.clone(),
                }),
            )
            .await?;
    }

    ctx.log("user", json!({ "step": key, "parts": &parts })).await?;

    let reply = ctx
        .sessions
        .provider()
        .prompt(
            &resolved.handle,
            &parts,
            ctx.model.as_deref(),
            Some(&resolved.name),
            &ctx.cancel,
        )
        .await?;
    let raw = reply.parts.last().cloned().unwrap_or_default();

    ctx.log(
        format!("{}.{role}", ctx.label),
        json!({ "step": key, "text": &raw, "messageId": &reply.message_id }),
    )
    .await?;

    let parsed = parse_reply(key, &raw, parser)?;
    Ok(StepResult::new("agent", key, raw, parsed))
}

/// Apply the role's parser to a reply. `unknown` parsers pass the decoded
/// JSON through, or the raw text when the reply is not JSON at all.
fn parse_reply(key: &str, raw: &str, parser: &ParserSchema) -> Result<Value, WorkflowError> {
    let candidate = serde_json::from_str::<Value>(raw.trim())
        .ok()
        .or_else(|| extract_json(raw));

    if matches!(parser, ParserSchema::Unknown) {
        return Ok(candidate.unwrap_or_else(|| Value::String(raw.to_string())));
    }

    let value = candidate.ok_or_else(|| WorkflowError::Parse {
        step: key.to_string(),
        details: "reply is not valid JSON".to_string(),
    })?;
    compile(parser)
        .validate(Some(&value))
        .map_err(|issue| WorkflowError::Parse {
            step: key.to_string(),
            details: issue.to_string(),
        })
}

/// One extraction pass: drop markdown fences, then cut to the outermost
/// `{…}` or `[…]` span.
fn extract_json(raw: &str) -> Option<Value> {
    let mut text = raw.trim();

    if let Some(fence_start) = text.find("```") {
        let after = &text[fence_start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body_end = body.find("```").unwrap_or(body.len());
        text = body[..body_end].trim();
    }

    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&text[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status_parser() -> ParserSchema {
        serde_json::from_value(json!({
            "type": "object",
            "properties": {
                "status": { "type": "string", "enum": ["ok", "fail"] }
            },
            "required": ["status"]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_bare_json() {
        let parsed = parse_reply("s", r#"{"status":"ok"}"#, &status_parser()).unwrap();
        assert_eq!(parsed, json!({ "status": "ok" }));
    }

    #[test]
    fn test_parse_fenced_reply() {
        let raw = "Here is my verdict:\n```json\n{\"status\": \"ok\"}\n```\nDone.";
        let parsed = parse_reply("s", raw, &status_parser()).unwrap();
        assert_eq!(parsed, json!({ "status": "ok" }));
    }

    #[test]
    fn test_parse_prose_wrapped_reply() {
        let raw = "Sure! The answer is {\"status\": \"fail\"} as requested.";
        let parsed = parse_reply("s", raw, &status_parser()).unwrap();
        assert_eq!(parsed, json!({ "status": "fail" }));
    }

    #[test]
    fn test_parse_failure_is_parse_error() {
        let err = parse_reply("s", "no json here", &status_parser()).unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[test]
    fn test_schema_mismatch_is_parse_error() {
        let err = parse_reply("s", r#"{"status":"maybe"}"#, &status_parser()).unwrap_err();
        assert!(matches!(err, WorkflowError::Parse { .. }));
    }

    #[test]
    fn test_unknown_parser_accepts_anything() {
        let parsed = parse_reply("s", "plain prose", &ParserSchema::Unknown).unwrap();
        assert_eq!(parsed, json!("plain prose"));
        let parsed = parse_reply("s", r#"{"free": 1}"#, &ParserSchema::Unknown).unwrap();
        assert_eq!(parsed, json!({ "free": 1 }));
    }
}
