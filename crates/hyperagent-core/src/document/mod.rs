//! Workflow document types — the declarative description a run executes.
//!
//! A document names its roles (LLM personas with system prompts and
//! response parsers), a shared key/value state bag, and a flow: an
//! optional bootstrap step plus a repeating round of ordered steps.
//!
//! ```yaml
//! id: "review-loop.v1"
//! sessions:
//!   roles:
//!     - role: worker
//!     - role: verifier
//!       nameTemplate: "verifier-{{runId}}"
//! parsers:
//!   verdict:
//!     type: object
//!     properties:
//!       status: { type: string, enum: [instruct, approve, fail] }
//!     required: [status]
//! roles:
//!   worker:
//!     systemPrompt: "Implement the requested change."
//!     parser: freeform
//!     tools: { read: true, write: true, bash: true }
//!   verifier:
//!     systemPrompt: "Verify the work. Reply with a verdict."
//!     parser: verdict
//! flow:
//!   round:
//!     maxRounds: 5
//!     defaultOutcome: { outcome: max-rounds, reason: "no approval" }
//!     steps: [...]
//! ```
//!
//! Documents are immutable once validated; [`validate::validate_document`]
//! performs the structural and referential checks.

pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Condition;
use crate::error::WorkflowError;
use crate::parser::ParserSchema;

pub use validate::validate_document;

/// Top-level workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDocument {
    /// Workflow id, unique per registry entry.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Default model for agent steps; a run option may override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Session declarations, one per role that will hold a conversation.
    #[serde(default)]
    pub sessions: SessionsSpec,

    /// Named parser schemas referenced by roles.
    #[serde(default)]
    pub parsers: BTreeMap<String, ParserSchema>,

    /// LLM personas used by `agent` steps.
    #[serde(default)]
    pub roles: BTreeMap<String, RoleSpec>,

    /// Schemas for run inputs, validated at harness start.
    #[serde(default)]
    pub user: BTreeMap<String, ParserSchema>,

    /// Initial state bag, rendered once at run start.
    #[serde(default)]
    pub state: StateSpec,

    pub flow: FlowSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsSpec {
    #[serde(default)]
    pub roles: Vec<SessionRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRole {
    pub role: String,

    /// Rendered over `{runId}`. A stable name lets the provider reuse an
    /// existing session across runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_template: Option<String>,
}

/// An LLM persona: system prompt, response parser, tool permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    pub system_prompt: String,

    /// Must key into the document's `parsers` map.
    pub parser: String,

    #[serde(default)]
    pub tools: ToolPermissions,
}

/// Tool permission switches conveyed at session creation. Omitted keys
/// default to false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPermissions {
    pub read: bool,
    pub write: bool,
    pub edit: bool,
    pub bash: bool,
    pub grep: bool,
    pub glob: bool,
    pub list: bool,
    pub patch: bool,
    pub todowrite: bool,
    pub todoread: bool,
    pub webfetch: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSpec {
    /// key → template string, rendered over `{user, run, round: 0}`.
    #[serde(default)]
    pub initial: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap: Option<Step>,

    pub round: RoundSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSpec {
    /// First step of each round; defaults to the first listed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    pub steps: Vec<Step>,

    pub max_rounds: u32,

    /// Fired when `maxRounds` is exhausted without a terminal transition.
    pub default_outcome: OutcomeSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSpec {
    pub outcome: String,

    /// Rendered against the scope at termination time.
    #[serde(default)]
    pub reason: String,
}

/// A unit of work within a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique within the round; scope path `steps.<key>` exposes the result.
    pub key: String,

    /// Explicit successor; defaults to the next listed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    /// key → template, rendered against the scope extended with `parsed`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_updates: BTreeMap<String, String>,

    /// Evaluated in order after the step; the first match fires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<Transition>,

    /// Terminal transitions, evaluated only when no transition fired.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exits: Vec<Transition>,

    #[serde(flatten)]
    pub kind: StepKind,
}

/// The four step kinds, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StepKind {
    #[serde(rename_all = "camelCase")]
    Agent { role: String, prompt: Vec<String> },

    #[serde(rename_all = "camelCase")]
    Cli {
        command: String,

        /// Positional argument templates, rendered in list order.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Vec<String>>,

        /// Keyed argument templates; rendered values are passed in
        /// lexicographic key order.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args_object: Option<BTreeMap<String, String>>,

        /// Optional coercion schema applied to the rendered arguments.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args_schema: Option<ParserSchema>,

        /// Working directory; relative paths resolve under the session dir,
        /// which is also the default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,

        /// Scope path whose value is piped to stdin. Byte buffers pass
        /// unchanged; strings pass as UTF-8.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdin_from: Option<String>,

        #[serde(default)]
        capture: CaptureMode,
    },

    #[serde(rename_all = "camelCase")]
    Workflow {
        workflow_id: String,

        /// Input tree handed to the child run; string leaves are rendered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_schema: Option<ParserSchema>,
    },

    #[serde(rename_all = "camelCase")]
    Transform {
        /// Arbitrary tree whose string leaves are rendered into `parsed`.
        template: Value,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_schema: Option<ParserSchema>,
    },
}

impl StepKind {
    /// Step kind label used in results and provenance.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Cli { .. } => "cli",
            StepKind::Workflow { .. } => "workflow",
            StepKind::Transform { .. } => "transform",
        }
    }
}

/// How cli step output is captured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Text,
    Buffer,
    Both,
}

/// A conditional branch taken after a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub condition: Condition,

    /// Terminates the run with this label when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,

    /// Rendered against the scope when the transition fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub state_updates: BTreeMap<String, String>,

    /// Jump target within the round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl WorkflowDocument {
    /// Parse a document from a JSON string. Run
    /// [`validate_document`] before executing it.
    pub fn from_json(json: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(json)
            .map_err(|e| WorkflowError::Schema(format!("failed to parse workflow JSON: {e}")))
    }

    /// Parse a document from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, WorkflowError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WorkflowError::Schema(format!("failed to parse workflow YAML: {e}")))
    }

    /// Load a document from a file, dispatching on the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Schema(format!("failed to read workflow file '{}': {e}", path.display()))
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Find a round step by key.
    pub fn round_step(&self, key: &str) -> Option<&Step> {
        self.flow.round.steps.iter().find(|s| s.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_document() {
        let doc = WorkflowDocument::from_json(
            &json!({
                "id": "solo.v1",
                "sessions": { "roles": [{ "role": "agent" }] },
                "parsers": { "freeform": { "type": "unknown" } },
                "roles": {
                    "agent": { "systemPrompt": "Do the thing.", "parser": "freeform" }
                },
                "flow": {
                    "round": {
                        "maxRounds": 1,
                        "defaultOutcome": { "outcome": "max-rounds", "reason": "ran out" },
                        "steps": [{
                            "key": "work",
                            "type": "agent",
                            "role": "agent",
                            "prompt": ["{{user.goal}}"],
                            "exits": [{ "condition": "always", "outcome": "completed" }]
                        }]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(doc.id, "solo.v1");
        assert_eq!(doc.flow.round.steps.len(), 1);
        let step = &doc.flow.round.steps[0];
        assert_eq!(step.key, "work");
        assert!(matches!(&step.kind, StepKind::Agent { role, .. } if role == "agent"));
        assert_eq!(step.exits.len(), 1);
    }

    #[test]
    fn test_parse_cli_step_yaml() {
        let doc = WorkflowDocument::from_yaml(
            r#"
id: pipeline.v1
flow:
  round:
    maxRounds: 1
    defaultOutcome: { outcome: done }
    steps:
      - key: dump
        type: cli
        command: printf
        args: ["%b", "payload"]
        capture: buffer
      - key: hex
        type: cli
        command: xxd
        argsObject: { p: "-p" }
        stdinFrom: steps.dump.parsed.stdoutBuffer
        capture: both
"#,
        )
        .unwrap();

        let StepKind::Cli { capture, stdin_from, .. } = &doc.flow.round.steps[1].kind else {
            panic!("expected cli step");
        };
        assert_eq!(*capture, CaptureMode::Both);
        assert_eq!(stdin_from.as_deref(), Some("steps.dump.parsed.stdoutBuffer"));
    }

    #[test]
    fn test_tool_permissions_default_false() {
        let perms: ToolPermissions = serde_json::from_value(json!({ "bash": true })).unwrap();
        assert!(perms.bash);
        assert!(!perms.read && !perms.write && !perms.webfetch);
    }

    #[test]
    fn test_document_roundtrip() {
        let doc = WorkflowDocument::from_json(
            &json!({
                "id": "roundtrip.v1",
                "flow": {
                    "round": {
                        "start": "only",
                        "maxRounds": 2,
                        "defaultOutcome": { "outcome": "max-rounds" },
                        "steps": [{
                            "key": "only",
                            "type": "transform",
                            "template": { "echo": "{{round}}" }
                        }]
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        let reparsed =
            WorkflowDocument::from_json(&serde_json::to_string(&doc).unwrap()).unwrap();
        assert_eq!(reparsed.id, doc.id);
        assert_eq!(reparsed.flow.round.start.as_deref(), Some("only"));
    }
}
